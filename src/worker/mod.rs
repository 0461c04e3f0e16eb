//! Task execution workers
//!
//! A worker owns one agent identity and one provider binding.  It turns a
//! claimed bead into a multi-turn conversation: resolve the session, build
//! the prompt under the token budget, call the provider, persist the
//! exchange.  A worker serializes its own tasks through its state machine;
//! parallelism lives in the [`pool`].

pub mod pool;

use crate::conversation::{
    assemble_task_messages, ConversationContext, ConversationMessage, DEFAULT_SESSION_TTL_HOURS,
};
use crate::provider::{ChatCompletionRequest, ChatProvider, ProviderError, Role};
use crate::state::store::StateStore;
use crate::state::Agent;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Working,
    Stopped,
    Error,
}

/// A unit of execution handed to a worker by the dispatcher.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub bead_id: String,
    pub project_id: String,
    pub description: String,
    pub context: Option<String>,
    /// Explicit session override; otherwise the worker resolves by bead id.
    pub session: Option<ConversationContext>,
}

impl Task {
    pub fn for_bead(bead_id: &str, project_id: &str, description: impl Into<String>) -> Self {
        Self {
            id: format!("task-{}", Uuid::new_v4()),
            bead_id: bead_id.to_string(),
            project_id: project_id.to_string(),
            description: description.into(),
            context: None,
            session: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub worker_id: String,
    pub agent_id: String,
    pub response: String,
    pub tokens_used: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("worker {0} is not idle")]
    NotIdle(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("provider returned no choices")]
    EmptyResponse,
    #[error("task cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TaskError {
    /// Whether the bead should go back to Open for another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Provider(e) => e.is_retryable(),
            TaskError::EmptyResponse | TaskError::Cancelled | TaskError::Store(_) => true,
            TaskError::NotIdle(_) => true,
        }
    }
}

struct WorkerInner {
    state: WorkerState,
    current_task: Option<String>,
    last_active: DateTime<Utc>,
}

pub struct Worker {
    id: String,
    agent: Agent,
    provider: Arc<dyn ChatProvider>,
    model: String,
    store: Arc<dyn StateStore>,
    temperature: f32,
    session_ttl: Duration,
    inner: Mutex<WorkerInner>,
}

impl Worker {
    pub fn new(
        agent: Agent,
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            id: format!("wrk-{:x}", rand::random::<u64>()),
            agent,
            provider,
            model: model.into(),
            store,
            temperature: DEFAULT_TEMPERATURE,
            session_ttl: Duration::hours(DEFAULT_SESSION_TTL_HOURS),
            inner: Mutex::new(WorkerInner {
                state: WorkerState::Idle,
                current_task: None,
                last_active: Utc::now(),
            }),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn current_task(&self) -> Option<String> {
        self.inner.lock().current_task.clone()
    }

    /// Stop accepting tasks.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.state = WorkerState::Stopped;
        inner.current_task = None;
    }

    /// Bring a Stopped or Error worker back to Idle.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, WorkerState::Stopped | WorkerState::Error) {
            inner.state = WorkerState::Idle;
            inner.current_task = None;
            inner.last_active = Utc::now();
        }
    }

    fn begin(&self, task_id: &str) -> Result<(), TaskError> {
        let mut inner = self.inner.lock();
        if inner.state != WorkerState::Idle {
            return Err(TaskError::NotIdle(self.id.clone()));
        }
        inner.state = WorkerState::Working;
        inner.current_task = Some(task_id.to_string());
        inner.last_active = Utc::now();
        Ok(())
    }

    fn finish(&self, state: WorkerState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.current_task = None;
        inner.last_active = Utc::now();
    }

    /// Execute one task end to end.  Fails fast on a non-Idle worker; in
    /// every other path the worker returns to Idle (Error on a failed
    /// persist) when the call ends.
    pub async fn execute_task(
        &self,
        task: Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, TaskError> {
        self.begin(&task.id)?;
        let outcome = self.run_task(task, cancel).await;
        match &outcome {
            Ok(_) | Err(TaskError::Provider(_)) | Err(TaskError::EmptyResponse)
            | Err(TaskError::Cancelled) => self.finish(WorkerState::Idle),
            Err(TaskError::Store(_)) => self.finish(WorkerState::Error),
            Err(TaskError::NotIdle(_)) => {}
        }
        outcome
    }

    async fn run_task(
        &self,
        task: Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, TaskError> {
        let mut context = self.resolve_session(&task).await?;
        let persisted_len = context.messages.len();

        let messages = assemble_task_messages(
            &mut context,
            &self.agent.name,
            &self.agent.persona,
            &self.model,
            &task.description,
            task.context.as_deref(),
        );

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: None,
        };

        tracing::debug!(
            worker_id = %self.id,
            agent = %self.agent.name,
            bead_id = %task.bead_id,
            model = %self.model,
            "executing task"
        );

        let response = tokio::select! {
            response = self.provider.create_chat_completion(request) => response?,
            _ = cancel.cancelled() => {
                tracing::info!(worker_id = %self.id, task_id = %task.id, "task cancelled");
                return Err(TaskError::Cancelled);
            }
        };

        let text = response
            .text()
            .map(str::to_string)
            .ok_or(TaskError::EmptyResponse)?;

        context.add_message(Role::Assistant, text.clone());

        // Persist only the turns added during this execution; the CAS
        // guards against a session swap underneath us.
        let new_messages: Vec<ConversationMessage> =
            context.messages[persisted_len..].to_vec();
        let appended = self
            .store
            .append_conversation(&context.session_id, persisted_len, new_messages)
            .await?;
        if !appended {
            tracing::warn!(
                session_id = %context.session_id,
                "conversation advanced concurrently, dropping this turn's transcript"
            );
        }
        self.store.touch_agent(&self.agent.id).await?;

        Ok(TaskResult {
            task_id: task.id,
            worker_id: self.id.clone(),
            agent_id: self.agent.id.clone(),
            response: text,
            tokens_used: response.usage.total_tokens,
            completed_at: Utc::now(),
        })
    }

    /// Session resolution: explicit task session, then lookup by bead, then
    /// a fresh session.  Expired sessions are replaced.
    async fn resolve_session(&self, task: &Task) -> Result<ConversationContext, TaskError> {
        if let Some(session) = &task.session {
            // Adopt the caller-provided session as the bead's current one.
            self.store.put_conversation(session.clone()).await?;
            return Ok(session.clone());
        }

        let now = Utc::now();
        match self.store.conversation_by_bead(&task.bead_id).await? {
            Some(existing) if !existing.is_expired(now) => Ok(existing),
            stale => {
                if let Some(old) = stale {
                    tracing::debug!(
                        session_id = %old.session_id,
                        bead_id = %task.bead_id,
                        "session expired, starting a new one"
                    );
                }
                let fresh = ConversationContext::new(
                    task.bead_id.clone(),
                    task.project_id.clone(),
                    self.session_ttl,
                );
                self.store.put_conversation(fresh.clone()).await?;
                Ok(fresh)
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
