//! Bead dispatcher
//!
//! Claims eligible beads for idle agents and hands the pairs to the worker
//! pool.  Eligibility is Open with every blocker Closed; order is priority
//! first (P0 wins), then due date, then age.  The claim itself is the
//! store's atomic compare-and-set, so two concurrent passes cannot assign
//! the same bead, and a lost race is just a skip.
//!
//! The dispatcher also owns the compensation policy: task outcomes come
//! back over the pool channel, successes close the bead, provider failures
//! send it back to Open with a retry bump until the cap blocks it.

use crate::bus::{Event, EventBus, EventType};
use crate::state::idle::IdleDetector;
use crate::state::store::StateStore;
use crate::state::{Agent, AgentStatus, Bead, BeadStatus};
use crate::worker::pool::{TaskAssignment, TaskOutcome, WorkerPool};
use crate::worker::{Task, TaskError};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Period of the level-triggered dispatch pass.
    pub interval: Duration,
    /// Provider failures tolerated per bead before it is Blocked.
    pub retry_cap: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            retry_cap: 3,
        }
    }
}

/// Summary of one dispatch pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    pub eligible: usize,
    pub dispatched: usize,
    /// Claims lost to a concurrent pass or submissions without a worker.
    pub skipped: usize,
    pub pairs: Vec<(String, String)>,
}

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    pool: Arc<WorkerPool>,
    idle: Arc<IdleDetector>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        pool: Arc<WorkerPool>,
        idle: Arc<IdleDetector>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            bus,
            pool,
            idle,
            config,
        }
    }

    /// One dispatch pass.  A store error aborts the pass; the CAS claim
    /// guarantees no partial state is left behind.
    pub async fn dispatch_once(&self, project_id: Option<&str>) -> Result<DispatchReport> {
        let beads = self.store.beads().await?;
        let agents = self.store.agents().await?;

        let closed: HashSet<&str> = beads
            .iter()
            .filter(|b| b.status == BeadStatus::Closed)
            .map(|b| b.id.as_str())
            .collect();

        let mut eligible: Vec<&Bead> = beads
            .iter()
            .filter(|b| b.status == BeadStatus::Open)
            .filter(|b| project_id.is_none_or(|p| b.project_id == p))
            .filter(|b| b.blocked_by.iter().all(|dep| closed.contains(dep.as_str())))
            .collect();
        eligible.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| match (a.due_date, b.due_date) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut idle_agents: Vec<&Agent> = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .filter(|a| project_id.is_none_or(|p| a.project_id == p))
            .collect();
        idle_agents.sort_by(|a, b| a.id.cmp(&b.id));

        let mut report = DispatchReport {
            eligible: eligible.len(),
            ..DispatchReport::default()
        };
        let mut taken: HashSet<&str> = HashSet::new();

        for bead in eligible {
            let candidate = idle_agents
                .iter()
                .find(|a| !taken.contains(a.id.as_str()) && agent_matches(a, bead));
            let Some(agent) = candidate else {
                continue;
            };

            if !self.store.claim_bead(&bead.id, &agent.id).await? {
                // Lost the race; leave this bead for the next pass.
                report.skipped += 1;
                continue;
            }
            taken.insert(agent.id.as_str());

            let mut task = Task::for_bead(&bead.id, &bead.project_id, if bead.description.is_empty() {
                bead.title.clone()
            } else {
                bead.description.clone()
            });
            task.context = (!bead.tags.is_empty()).then(|| format!("Tags: {}", bead.tags.join(", ")));

            if let Err(e) = self.pool.submit(TaskAssignment {
                agent_id: agent.id.clone(),
                task,
            }) {
                tracing::warn!(bead_id = %bead.id, agent_id = %agent.id, error = %e, "submit failed, releasing claim");
                self.store
                    .release_claim(&bead.id, &agent.id, BeadStatus::Open, None, false)
                    .await?;
                taken.remove(agent.id.as_str());
                report.skipped += 1;
                continue;
            }

            self.idle.record_agent_activity(&bead.project_id);
            self.bus.publish(
                Event::new(EventType::BeadStatusChanged, "dispatcher")
                    .with_project(bead.project_id.clone())
                    .with_data("bead_id", serde_json::json!(bead.id))
                    .with_data("status", serde_json::json!(BeadStatus::InProgress.as_str()))
                    .with_data("assigned_to", serde_json::json!(agent.id)),
            );

            report.dispatched += 1;
            report.pairs.push((bead.id.clone(), agent.id.clone()));
        }

        if report.dispatched > 0 {
            tracing::info!(
                eligible = report.eligible,
                dispatched = report.dispatched,
                "dispatch pass"
            );
        }
        Ok(report)
    }

    /// Apply the completion policy for a finished task.
    pub async fn handle_outcome(&self, outcome: TaskOutcome) -> Result<()> {
        match outcome.result {
            Ok(result) => {
                self.store
                    .release_claim(
                        &outcome.bead_id,
                        &outcome.agent_id,
                        BeadStatus::Closed,
                        None,
                        false,
                    )
                    .await?;
                self.idle.record_bead_activity(&outcome.project_id);
                self.bus.publish(
                    Event::new(EventType::BeadClosed, "dispatcher")
                        .with_project(outcome.project_id)
                        .with_data("bead_id", serde_json::json!(outcome.bead_id))
                        .with_data("agent_id", serde_json::json!(outcome.agent_id))
                        .with_data("tokens_used", serde_json::json!(result.tokens_used)),
                );
                Ok(())
            }
            Err(TaskError::Cancelled) => {
                // Cancelled work is not a strike against the bead.
                self.store
                    .release_claim(
                        &outcome.bead_id,
                        &outcome.agent_id,
                        BeadStatus::Open,
                        None,
                        false,
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                let failures_so_far = self
                    .store
                    .bead(&outcome.bead_id)
                    .await?
                    .map(|b| b.retry_count)
                    .unwrap_or(0);
                let exhausted = failures_so_far + 1 >= self.config.retry_cap;
                let to = if exhausted {
                    BeadStatus::Blocked
                } else {
                    BeadStatus::Open
                };

                self.store
                    .release_claim(
                        &outcome.bead_id,
                        &outcome.agent_id,
                        to,
                        Some(e.to_string()),
                        true,
                    )
                    .await?;

                if exhausted {
                    tracing::error!(
                        bead_id = %outcome.bead_id,
                        retries = failures_so_far + 1,
                        error = %e,
                        "retry cap reached, bead blocked"
                    );
                    self.bus.publish(
                        Event::new(EventType::BeadStatusChanged, "dispatcher")
                            .with_project(outcome.project_id)
                            .with_data("bead_id", serde_json::json!(outcome.bead_id))
                            .with_data("status", serde_json::json!(BeadStatus::Blocked.as_str()))
                            .with_data("error", serde_json::json!(e.to_string())),
                    );
                }
                Ok(())
            }
        }
    }

    /// Dispatch loop: level-triggered by the interval, edge-triggered by
    /// bus events, plus the outcome lane from the worker pool.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut outcomes: mpsc::Receiver<TaskOutcome>,
    ) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events = self.bus.subscribe();

        tracing::info!(interval = ?self.config.interval, "dispatcher started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.dispatch_once(None).await {
                        tracing::warn!(error = %e, "dispatch pass failed, retrying next tick");
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { continue };
                    if matches!(
                        event.event_type,
                        EventType::BeadCreated
                            | EventType::AgentStatusChanged
                            | EventType::DispatcherTrigger
                    ) {
                        if let Err(e) = self.dispatch_once(event.project_id.as_deref()).await {
                            tracing::warn!(error = %e, "event-driven dispatch failed");
                        }
                    }
                }
                outcome = outcomes.recv() => {
                    let Some(outcome) = outcome else { continue };
                    if let Err(e) = self.handle_outcome(outcome).await {
                        tracing::warn!(error = %e, "outcome handling failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("dispatcher stopped");
                        return;
                    }
                }
            }
        }
    }
}

fn agent_matches(agent: &Agent, bead: &Bead) -> bool {
    if let Some(role) = bead.required_role.as_deref() {
        return agent.role == role;
    }
    if let Some(capability) = bead.required_capability.as_deref() {
        return agent.has_capability(capability);
    }
    true
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatProvider, Choice,
        ProviderError, Usage,
    };
    use crate::state::idle::{IdleConfig, IdleDetector};
    use crate::state::store::MemoryStore;
    use crate::state::Priority;
    use crate::worker::{TaskResult, Worker};
    use async_trait::async_trait;
    use chrono::Utc;

    struct EchoProvider;

    #[async_trait]
    impl ChatProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        async fn create_chat_completion(
            &self,
            _request: ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, ProviderError> {
            Ok(ChatCompletionResponse {
                choices: vec![Choice {
                    message: ChatMessage::assistant("ACTION: DONE ok"),
                }],
                usage: Usage::default(),
            })
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<MemoryStore>,
        pool: Arc<WorkerPool>,
        outcomes: mpsc::Receiver<TaskOutcome>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new().into_arc();
        let idle = Arc::new(IdleDetector::new(IdleConfig::default()));
        let (tx, outcomes) = mpsc::channel(32);
        let pool = Arc::new(WorkerPool::new(4, tx));
        let dispatcher = Dispatcher::new(
            store.clone(),
            bus,
            pool.clone(),
            idle,
            DispatchConfig::default(),
        );
        Harness {
            dispatcher,
            store,
            pool,
            outcomes,
        }
    }

    async fn add_agent(h: &Harness, name: &str, role: &str) -> Agent {
        let agent = Agent::new(name, role, "proj-1", "echo");
        h.store.create_agent(agent.clone()).await.unwrap();
        h.pool.register_worker(Worker::new(
            agent.clone(),
            Arc::new(EchoProvider),
            "gpt-4",
            h.store.clone(),
        ));
        agent
    }

    fn bead_for_role(title: &str, role: &str, priority: Priority) -> Bead {
        let mut bead = Bead::new(title, "proj-1", "bug", priority);
        bead.required_role = Some(role.to_string());
        bead
    }

    #[tokio::test]
    async fn dispatches_by_priority_and_role() {
        let mut h = harness();
        let agent = add_agent(&h, "ada", "qa-engineer").await;

        let low = bead_for_role("low", "qa-engineer", Priority::P3);
        let high = bead_for_role("high", "qa-engineer", Priority::P0);
        h.store.create_bead(low.clone()).await.unwrap();
        h.store.create_bead(high.clone()).await.unwrap();

        let report = h.dispatcher.dispatch_once(Some("proj-1")).await.unwrap();
        // One idle agent: only the P0 bead goes out.
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.pairs[0], (high.id.clone(), agent.id.clone()));

        let stored = h.store.bead(&high.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BeadStatus::InProgress);
        let leftover = h.store.bead(&low.id).await.unwrap().unwrap();
        assert_eq!(leftover.status, BeadStatus::Open);

        let outcome = h.outcomes.recv().await.unwrap();
        assert!(outcome.result.is_ok());
    }

    #[tokio::test]
    async fn blocked_beads_wait_for_blockers() {
        let mut h = harness();
        add_agent(&h, "ada", "qa-engineer").await;

        let mut blocker = bead_for_role("blocker", "qa-engineer", Priority::P1);
        blocker.status = BeadStatus::Closed;
        let mut open_blocker = bead_for_role("pending blocker", "qa-engineer", Priority::P1);
        open_blocker.status = BeadStatus::Blocked;

        let mut ready = bead_for_role("ready", "qa-engineer", Priority::P2);
        ready.blocked_by.insert(blocker.id.clone());
        let mut waiting = bead_for_role("waiting", "qa-engineer", Priority::P0);
        waiting.blocked_by.insert(open_blocker.id.clone());

        for b in [blocker, open_blocker, ready.clone(), waiting.clone()] {
            h.store.create_bead(b).await.unwrap();
        }

        let report = h.dispatcher.dispatch_once(Some("proj-1")).await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.pairs[0].0, ready.id);
        // The P0 bead stays put: its blocker is still open.
        assert_eq!(
            h.store.bead(&waiting.id).await.unwrap().unwrap().status,
            BeadStatus::Open
        );
        let _ = h.outcomes.recv().await;
    }

    #[tokio::test]
    async fn capability_match_when_no_role_required() {
        let mut h = harness();
        let mut specialist = Agent::new("spec", "generalist", "proj-1", "echo");
        specialist.persona.capabilities = vec!["deploys".into()];
        h.store.create_agent(specialist.clone()).await.unwrap();
        h.pool.register_worker(Worker::new(
            specialist.clone(),
            Arc::new(EchoProvider),
            "gpt-4",
            h.store.clone(),
        ));
        // A second idle agent without the capability, sorted first by id to
        // prove matching skips it.
        let other = Agent::new("aaa", "generalist", "proj-1", "echo");
        h.store.create_agent(other.clone()).await.unwrap();

        let mut bead = Bead::new("ship it", "proj-1", "release", Priority::P1);
        bead.required_capability = Some("deploys".into());
        h.store.create_bead(bead.clone()).await.unwrap();

        let report = h.dispatcher.dispatch_once(Some("proj-1")).await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.pairs[0].1, specialist.id);
        let _ = h.outcomes.recv().await;
    }

    #[tokio::test]
    async fn lost_claim_is_skipped() {
        let h = harness();
        let agent = add_agent(&h, "ada", "qa-engineer").await;
        let rival = Agent::new("rival", "qa-engineer", "proj-1", "echo");
        h.store.create_agent(rival.clone()).await.unwrap();

        let bead = bead_for_role("contested", "qa-engineer", Priority::P1);
        h.store.create_bead(bead.clone()).await.unwrap();
        // Another pass already claimed it.
        assert!(h.store.claim_bead(&bead.id, &rival.id).await.unwrap());

        let report = h.dispatcher.dispatch_once(Some("proj-1")).await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.eligible, 0);

        // Still owned by the rival.
        let stored = h.store.bead(&bead.id).await.unwrap().unwrap();
        assert_eq!(stored.assigned_to.as_deref(), Some(rival.id.as_str()));
        let _ = agent;
    }

    #[tokio::test]
    async fn success_closes_bead_and_frees_agent() {
        let mut h = harness();
        let agent = add_agent(&h, "ada", "qa-engineer").await;
        let bead = bead_for_role("work", "qa-engineer", Priority::P1);
        h.store.create_bead(bead.clone()).await.unwrap();

        h.dispatcher.dispatch_once(Some("proj-1")).await.unwrap();
        let outcome = h.outcomes.recv().await.unwrap();
        h.dispatcher.handle_outcome(outcome).await.unwrap();

        assert_eq!(
            h.store.bead(&bead.id).await.unwrap().unwrap().status,
            BeadStatus::Closed
        );
        let freed = h.store.agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(freed.status, AgentStatus::Idle);
        assert_eq!(freed.current_task, None);
    }

    #[tokio::test]
    async fn provider_failure_reverts_then_blocks_at_cap() {
        let h = harness();
        let agent = add_agent(&h, "ada", "qa-engineer").await;
        let bead = bead_for_role("flaky", "qa-engineer", Priority::P1);
        h.store.create_bead(bead.clone()).await.unwrap();

        let failed_outcome = |result| TaskOutcome {
            agent_id: agent.id.clone(),
            bead_id: bead.id.clone(),
            project_id: "proj-1".into(),
            task_id: "task-x".into(),
            result,
        };

        // Failures 1 and 2: back to Open with a bumped retry counter.
        for expected_retries in 1..=2u32 {
            assert!(h.store.claim_bead(&bead.id, &agent.id).await.unwrap());
            h.dispatcher
                .handle_outcome(failed_outcome(Err(TaskError::Provider(
                    ProviderError::RateLimited,
                ))))
                .await
                .unwrap();
            let stored = h.store.bead(&bead.id).await.unwrap().unwrap();
            assert_eq!(stored.status, BeadStatus::Open);
            assert_eq!(stored.retry_count, expected_retries);
        }

        // Failure 3 hits the cap: Blocked with the error note.
        assert!(h.store.claim_bead(&bead.id, &agent.id).await.unwrap());
        h.dispatcher
            .handle_outcome(failed_outcome(Err(TaskError::Provider(
                ProviderError::RateLimited,
            ))))
            .await
            .unwrap();
        let stored = h.store.bead(&bead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BeadStatus::Blocked);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.error_note.is_some());
    }

    #[tokio::test]
    async fn cancellation_releases_without_retry_bump() {
        let h = harness();
        let agent = add_agent(&h, "ada", "qa-engineer").await;
        let bead = bead_for_role("paused", "qa-engineer", Priority::P1);
        h.store.create_bead(bead.clone()).await.unwrap();
        assert!(h.store.claim_bead(&bead.id, &agent.id).await.unwrap());

        h.dispatcher
            .handle_outcome(TaskOutcome {
                agent_id: agent.id.clone(),
                bead_id: bead.id.clone(),
                project_id: "proj-1".into(),
                task_id: "task-x".into(),
                result: Err(TaskError::Cancelled),
            })
            .await
            .unwrap();

        let stored = h.store.bead(&bead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BeadStatus::Open);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn success_outcome_reports_identity() {
        let h = harness();
        let agent = add_agent(&h, "ada", "qa-engineer").await;
        let bead = bead_for_role("done", "qa-engineer", Priority::P2);
        h.store.create_bead(bead.clone()).await.unwrap();
        assert!(h.store.claim_bead(&bead.id, &agent.id).await.unwrap());

        h.dispatcher
            .handle_outcome(TaskOutcome {
                agent_id: agent.id.clone(),
                bead_id: bead.id.clone(),
                project_id: "proj-1".into(),
                task_id: "task-x".into(),
                result: Ok(TaskResult {
                    task_id: "task-x".into(),
                    worker_id: "wrk-1".into(),
                    agent_id: agent.id.clone(),
                    response: "ACTION: DONE".into(),
                    tokens_used: 42,
                    completed_at: Utc::now(),
                }),
            })
            .await
            .unwrap();

        assert_eq!(
            h.store.bead(&bead.id).await.unwrap().unwrap().status,
            BeadStatus::Closed
        );
    }
}
