//! Effectful actions behind motivation firings
//!
//! The engine stays pure-ish by funnelling every side effect through
//! [`ActionHandler`]: stimulus-bead creation, agent wake-ups, event-bus
//! publication, and workflow hand-off.  The production implementation
//! writes through the store and bus injected at construction.

use crate::bus::{Event, EventBus, EventType};
use crate::motivation::evaluators::TriggerData;
use crate::motivation::{Motivation, MotivationTrigger};
use crate::state::idle::IdleDetector;
use crate::state::store::StateStore;
use crate::state::{AgentStatus, Bead, Priority};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Effect interface invoked by the motivation engine.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Create a bead that carries the motivation's intent into the dispatch
    /// queue.  Returns the new bead id.
    async fn create_stimulus_bead(
        &self,
        motivation: &Motivation,
        trigger_data: &TriggerData,
    ) -> Result<String>;

    /// Bring a specific agent to a dispatchable state.  No-op on an agent
    /// that is already Working.
    async fn wake_agent(&self, agent_id: &str, motivation: &Motivation) -> Result<()>;

    /// Best-effort broadcast wake.  Succeeds when at least one agent of the
    /// role was reachable.
    async fn wake_agents_by_role(&self, role: &str, motivation: &Motivation) -> Result<()>;

    /// Forward the trigger record to the event bus.
    async fn publish_motivation_fired(&self, trigger: &MotivationTrigger) -> Result<()>;

    /// Hand off to a durable-workflow engine.  Implementations without one
    /// return an error rather than pretending.
    async fn start_workflow(&self, kind: &str, input: serde_json::Value) -> Result<String>;
}

/// Optional durable-workflow collaborator.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn start(&self, kind: &str, input: serde_json::Value) -> Result<String>;
}

/// Store-and-bus-backed [`ActionHandler`].
pub struct OrchestratorActionHandler {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    idle: Arc<IdleDetector>,
    workflows: Option<Arc<dyn WorkflowEngine>>,
}

impl OrchestratorActionHandler {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>, idle: Arc<IdleDetector>) -> Self {
        Self {
            store,
            bus,
            idle,
            workflows: None,
        }
    }

    pub fn with_workflow_engine(mut self, workflows: Arc<dyn WorkflowEngine>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    fn summarize_trigger_data(data: &TriggerData) -> String {
        if data.is_empty() {
            return String::new();
        }
        let mut keys: Vec<&String> = data.keys().collect();
        keys.sort();
        let lines: Vec<String> = keys
            .into_iter()
            .map(|k| format!("- {}: {}", k, data[k]))
            .collect();
        format!("\n\nTrigger data:\n{}", lines.join("\n"))
    }
}

#[async_trait]
impl ActionHandler for OrchestratorActionHandler {
    async fn create_stimulus_bead(
        &self,
        motivation: &Motivation,
        trigger_data: &TriggerData,
    ) -> Result<String> {
        let project_id = motivation.project_id.clone().unwrap_or_default();
        let mut bead = Bead::new(
            motivation.name.clone(),
            project_id.clone(),
            "stimulus",
            Priority::from_motivation_priority(motivation.priority),
        );
        bead.description = format!(
            "Raised by motivation {} ({:?}).{}",
            motivation.name,
            motivation.condition,
            Self::summarize_trigger_data(trigger_data)
        );
        bead.required_role = motivation.agent_role.clone();
        bead.tags = vec!["stimulus".to_string(), format!("motivation:{}", motivation.id)];

        let bead_id = bead.id.clone();
        self.store
            .create_bead(bead)
            .await
            .context("failed to persist stimulus bead")?;
        self.idle.record_bead_activity(&project_id);

        self.bus.publish(
            Event::new(EventType::BeadCreated, "motivation-engine")
                .with_project(project_id)
                .with_data("bead_id", serde_json::json!(bead_id))
                .with_data("motivation_id", serde_json::json!(motivation.id)),
        );

        Ok(bead_id)
    }

    async fn wake_agent(&self, agent_id: &str, motivation: &Motivation) -> Result<()> {
        let Some(agent) = self.store.agent(agent_id).await? else {
            bail!("agent not found: {agent_id}");
        };

        match agent.status {
            AgentStatus::Working => {
                // Already busy; waking is a no-op.
                return Ok(());
            }
            AgentStatus::Idle => {
                self.store.touch_agent(agent_id).await?;
            }
            AgentStatus::Paused | AgentStatus::Error => {
                let woken = self
                    .store
                    .compare_and_set_agent_status(agent_id, agent.status, AgentStatus::Idle)
                    .await?;
                if !woken {
                    bail!("agent {agent_id} changed state during wake");
                }
                self.bus.publish(
                    Event::new(EventType::AgentStatusChanged, "motivation-engine")
                        .with_project(agent.project_id.clone())
                        .with_data("agent_id", serde_json::json!(agent_id))
                        .with_data("status", serde_json::json!(AgentStatus::Idle.as_str()))
                        .with_data("motivation_id", serde_json::json!(motivation.id)),
                );
            }
        }

        tracing::debug!(agent_id, motivation_id = %motivation.id, "agent woken");
        Ok(())
    }

    async fn wake_agents_by_role(&self, role: &str, motivation: &Motivation) -> Result<()> {
        let agents = self.store.agents().await?;
        let of_role: Vec<_> = agents.into_iter().filter(|a| a.role == role).collect();
        if of_role.is_empty() {
            bail!("no agents with role {role}");
        }

        let mut woken = 0usize;
        for agent in &of_role {
            match self.wake_agent(&agent.id, motivation).await {
                Ok(()) => woken += 1,
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, role, error = %e, "wake failed");
                }
            }
        }

        if woken == 0 {
            bail!("failed to wake any of {} agents with role {role}", of_role.len());
        }
        Ok(())
    }

    async fn publish_motivation_fired(&self, trigger: &MotivationTrigger) -> Result<()> {
        self.bus.publish(
            Event::new(EventType::MotivationFired, "motivation-engine")
                .with_data("trigger", serde_json::to_value(trigger)?),
        );

        // Conditions with a dedicated bus type get mirrored for observers
        // that only care about that signal.
        let specific = match trigger.condition {
            crate::motivation::Condition::SystemIdle => Some(EventType::SystemIdle),
            crate::motivation::Condition::DeadlineApproach => Some(EventType::DeadlineApproaching),
            crate::motivation::Condition::DeadlinePassed => Some(EventType::DeadlinePassed),
            _ => None,
        };
        if let Some(event_type) = specific {
            let mut event = Event::new(event_type, "motivation-engine")
                .with_data("motivation_id", serde_json::json!(trigger.motivation_id));
            for (key, value) in &trigger.trigger_data {
                event = event.with_data(key.clone(), value.clone());
            }
            self.bus.publish(event);
        }
        Ok(())
    }

    async fn start_workflow(&self, kind: &str, input: serde_json::Value) -> Result<String> {
        match &self.workflows {
            Some(engine) => engine.start(kind, input).await,
            None => bail!("workflow engine not configured"),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
