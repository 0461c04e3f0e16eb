//! Worker pool
//!
//! Keeps the live worker set, matches dispatcher assignments to workers by
//! agent id, and bounds concurrent executions with a semaphore.  Outcomes
//! flow back to the dispatcher over a channel so claim compensation happens
//! in one place.

use super::{Task, TaskError, TaskResult, Worker, WorkerState};
use anyhow::{bail, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// An (agent, task) pair claimed by the dispatcher.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub agent_id: String,
    pub task: Task,
}

/// What happened to an assignment, reported back to the dispatcher.
#[derive(Debug)]
pub struct TaskOutcome {
    pub agent_id: String,
    pub bead_id: String,
    pub project_id: String,
    pub task_id: String,
    pub result: Result<TaskResult, TaskError>,
}

pub struct WorkerPool {
    workers: DashMap<String, Arc<Worker>>,
    permits: Arc<Semaphore>,
    outcomes: mpsc::Sender<TaskOutcome>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(max_parallel: usize, outcomes: mpsc::Sender<TaskOutcome>) -> Self {
        Self {
            workers: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            outcomes,
            cancel: CancellationToken::new(),
        }
    }

    /// Add a worker, keyed by its agent.  Replaces any previous worker for
    /// the same agent.
    pub fn register_worker(&self, worker: Worker) -> Arc<Worker> {
        let worker = Arc::new(worker);
        self.workers
            .insert(worker.agent_id().to_string(), worker.clone());
        tracing::info!(
            worker_id = %worker.id(),
            agent_id = %worker.agent_id(),
            "worker registered"
        );
        worker
    }

    pub fn worker_for_agent(&self, agent_id: &str) -> Option<Arc<Worker>> {
        self.workers.get(agent_id).map(|w| w.value().clone())
    }

    pub fn remove_worker(&self, agent_id: &str) -> Option<Arc<Worker>> {
        self.workers.remove(agent_id).map(|(_, w)| w)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Reset every worker stuck in Error back to Idle.  Returns how many
    /// were restarted.
    pub fn restart_errored(&self) -> usize {
        let mut restarted = 0;
        for entry in self.workers.iter() {
            if entry.value().state() == WorkerState::Error {
                entry.value().reset();
                restarted += 1;
            }
        }
        if restarted > 0 {
            tracing::info!(restarted, "errored workers restarted");
        }
        restarted
    }

    /// Cancel in-flight executions and refuse new ones.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.workers.iter() {
            entry.value().stop();
        }
    }

    /// Run an assignment on the owning worker.  The call returns once the
    /// execution is spawned; the outcome arrives on the pool's channel.
    pub fn submit(&self, assignment: TaskAssignment) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("worker pool is shut down");
        }
        let Some(worker) = self.worker_for_agent(&assignment.agent_id) else {
            bail!("no worker registered for agent {}", assignment.agent_id);
        };

        let permits = self.permits.clone();
        let outcomes = self.outcomes.clone();
        let cancel = self.cancel.child_token();
        let TaskAssignment { agent_id, task } = assignment;
        let bead_id = task.bead_id.clone();
        let project_id = task.project_id.clone();
        let task_id = task.id.clone();

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // pool dropped
            };
            let result = worker.execute_task(task, &cancel).await;
            if let Err(e) = &result {
                tracing::warn!(
                    agent_id = %agent_id,
                    bead_id = %bead_id,
                    error = %e,
                    "task execution failed"
                );
            }
            let _ = outcomes
                .send(TaskOutcome {
                    agent_id,
                    bead_id,
                    project_id,
                    task_id,
                    result,
                })
                .await;
        });

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatProvider, Choice,
        ProviderError, Usage,
    };
    use crate::state::store::{MemoryStore, StateStore};
    use crate::state::Agent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowProvider {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SlowProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }
        async fn create_chat_completion(
            &self,
            _request: ChatCompletionRequest,
        ) -> Result<ChatCompletionResponse, ProviderError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ChatCompletionResponse {
                choices: vec![Choice {
                    message: ChatMessage::assistant("done"),
                }],
                usage: Usage::default(),
            })
        }
    }

    async fn pool_with_workers(
        max_parallel: usize,
        count: usize,
        provider: Arc<SlowProvider>,
    ) -> (WorkerPool, mpsc::Receiver<TaskOutcome>, Vec<String>) {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(16);
        let pool = WorkerPool::new(max_parallel, tx);

        let mut agent_ids = Vec::new();
        for i in 0..count {
            let agent = Agent::new(format!("agent-{i}"), "qa-engineer", "proj-1", "slow");
            store.create_agent(agent.clone()).await.unwrap();
            agent_ids.push(agent.id.clone());
            pool.register_worker(Worker::new(agent, provider.clone(), "gpt-4", store.clone()));
        }
        (pool, rx, agent_ids)
    }

    #[tokio::test]
    async fn parallelism_is_capped() {
        let provider = SlowProvider::new();
        let (pool, mut rx, agents) = pool_with_workers(2, 4, provider.clone()).await;

        for (i, agent_id) in agents.iter().enumerate() {
            pool.submit(TaskAssignment {
                agent_id: agent_id.clone(),
                task: Task::for_bead(&format!("bd-{i}"), "proj-1", "go"),
            })
            .unwrap();
        }

        for _ in 0..4 {
            let outcome = rx.recv().await.unwrap();
            assert!(outcome.result.is_ok());
        }
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn outcome_carries_assignment_identity() {
        let provider = SlowProvider::new();
        let (pool, mut rx, agents) = pool_with_workers(1, 1, provider).await;

        pool.submit(TaskAssignment {
            agent_id: agents[0].clone(),
            task: Task::for_bead("bd-7", "proj-1", "go"),
        })
        .unwrap();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.agent_id, agents[0]);
        assert_eq!(outcome.bead_id, "bd-7");
        assert_eq!(outcome.project_id, "proj-1");
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected_synchronously() {
        let provider = SlowProvider::new();
        let (pool, _rx, _) = pool_with_workers(1, 0, provider).await;

        let err = pool
            .submit(TaskAssignment {
                agent_id: "agt-ghost".into(),
                task: Task::for_bead("bd-1", "proj-1", "go"),
            })
            .unwrap_err();
        assert!(err.to_string().contains("no worker registered"));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let provider = SlowProvider::new();
        let (pool, _rx, agents) = pool_with_workers(1, 1, provider).await;

        pool.shutdown();
        assert!(pool
            .submit(TaskAssignment {
                agent_id: agents[0].clone(),
                task: Task::for_bead("bd-1", "proj-1", "go"),
            })
            .is_err());
    }
}
