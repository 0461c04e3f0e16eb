//! Orchestrator wiring
//!
//! Builds the shared world (store, bus, idle detector), the motivation
//! engine, the dispatcher, and the worker pool, and runs them as one
//! process.  Construction is plain dependency injection: the engine holds
//! the registry and action handler; the action handler reaches back only
//! through the event bus.

use crate::actions::OrchestratorActionHandler;
use crate::bus::{Event, EventBus, EventType};
use crate::config::Config;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::motivation::defaults::register_defaults;
use crate::motivation::engine::{Engine, TickReport};
use crate::motivation::registry::Registry;
use crate::motivation::{Condition, Motivation, MotivationKind, MotivationStatus, RegistryError};
use crate::provider::openai::OpenAiProvider;
use crate::provider::{ChatProvider, ProviderRegistry};
use crate::state::idle::IdleDetector;
use crate::state::provider::StoreStateProvider;
use crate::state::store::{MemoryStore, StateStore};
use crate::state::Agent;
use crate::webhook::{self, WebhookState};
use crate::worker::pool::{TaskOutcome, WorkerPool};
use crate::worker::Worker;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Wire-shape for motivation registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotivationSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: MotivationKind,
    pub condition: Condition,
    #[serde(default)]
    pub agent_role: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub cooldown_seconds: u64,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub create_bead_on_trigger: bool,
    #[serde(default)]
    pub wake_agent: bool,
}

fn default_priority() -> u8 {
    50
}

impl MotivationSpec {
    fn into_motivation(self) -> Motivation {
        let mut m = Motivation::new(self.name, self.condition);
        m.kind = self.kind;
        m.description = self.description.unwrap_or_default();
        m.agent_role = self.agent_role;
        m.agent_id = self.agent_id;
        m.project_id = self.project_id;
        m.parameters = self.parameters;
        m.cooldown = Duration::from_secs(self.cooldown_seconds);
        m.priority = self.priority;
        m.create_bead_on_trigger = self.create_bead_on_trigger;
        m.wake_agent = self.wake_agent;
        m
    }
}

/// What the registry answered a registration with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationReceipt {
    pub id: String,
    pub status: MotivationStatus,
}

pub struct Orchestrator {
    config: Config,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    idle: Arc<IdleDetector>,
    registry: Arc<Registry>,
    engine: Arc<Engine>,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    providers: Mutex<ProviderRegistry>,
    outcome_rx: Mutex<Option<mpsc::Receiver<TaskOutcome>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: Config, store: Arc<dyn StateStore>) -> Result<Self> {
        let bus = EventBus::new().into_arc();
        let idle_config = config.idle_config();
        let idle = Arc::new(IdleDetector::new(idle_config));
        let registry = Arc::new(Registry::new(config.engine_config()));

        if config.engine().register_builtins {
            register_defaults(&registry).context("failed to register built-in motivations")?;
        }

        let state_provider = Arc::new(StoreStateProvider::new(store.clone(), idle.clone()));
        let actions = Arc::new(OrchestratorActionHandler::new(
            store.clone(),
            bus.clone(),
            idle.clone(),
        ));
        let engine = Arc::new(
            Engine::new(registry.clone(), state_provider, actions).with_idle_config(idle_config),
        );

        let (outcome_tx, outcome_rx) = mpsc::channel(256);
        let pool = Arc::new(WorkerPool::new(config.pool().max_parallel, outcome_tx));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            bus.clone(),
            pool.clone(),
            idle.clone(),
            config.dispatch_config(),
        ));

        let mut providers = ProviderRegistry::new();
        for (name, provider_config) in &config.providers {
            let Some(api_key) = provider_config.api_key.clone() else {
                tracing::warn!(provider = %name, "no api key configured, skipping provider");
                continue;
            };
            let provider: Arc<dyn ChatProvider> = match provider_config.base_url.clone() {
                Some(base_url) => Arc::new(OpenAiProvider::with_base_url(api_key, base_url, name)),
                None => Arc::new(OpenAiProvider::new(api_key)),
            };
            providers.register(name.clone(), provider);
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            bus,
            idle,
            registry,
            engine,
            dispatcher,
            pool,
            providers: Mutex::new(providers),
            outcome_rx: Mutex::new(Some(outcome_rx)),
            shutdown_tx,
        })
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Add a provider at runtime (tests, custom backends).
    pub fn register_provider(&self, id: impl Into<String>, provider: Arc<dyn ChatProvider>) {
        self.providers.lock().register(id, provider);
    }

    /// Register a motivation from its wire shape.
    pub fn register_motivation(
        &self,
        spec: MotivationSpec,
    ) -> Result<RegistrationReceipt, RegistryError> {
        let id = self.registry.register(spec.into_motivation())?;
        let status = self.registry.get(&id)?.status;
        Ok(RegistrationReceipt { id, status })
    }

    /// Persist an agent and spin up its worker.
    pub async fn register_agent(&self, agent: Agent) -> Result<()> {
        let provider = self
            .providers
            .lock()
            .get(&agent.provider_id)
            .with_context(|| format!("unknown provider: {}", agent.provider_id))?;

        let model = self
            .config
            .providers
            .get(&agent.provider_id)
            .and_then(|p| p.model.clone())
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| "gpt-4-turbo".to_string());

        self.store.create_agent(agent.clone()).await?;
        let worker = Worker::new(agent.clone(), provider, model, self.store.clone())
            .with_temperature(self.config.session().temperature)
            .with_session_ttl(self.config.session_ttl());
        self.pool.register_worker(worker);

        self.bus.publish(
            Event::new(EventType::AgentStatusChanged, "orchestrator")
                .with_project(agent.project_id.clone())
                .with_data("agent_id", serde_json::json!(agent.id))
                .with_data("status", serde_json::json!(agent.status.as_str())),
        );
        Ok(())
    }

    /// External-heartbeat mode: one engine tick, driven by the host clock.
    pub async fn tick_motivations(&self) -> TickReport {
        self.engine.tick().await
    }

    /// One dispatch pass, callable from an external scheduler.
    pub async fn dispatch_once(&self, project_id: Option<&str>) -> Result<DispatchReport> {
        self.dispatcher.dispatch_once(project_id).await
    }

    /// Fire a motivation now, ignoring its cooldown.
    pub async fn manual_trigger(
        &self,
        motivation_id: &str,
    ) -> Result<crate::motivation::MotivationTrigger, RegistryError> {
        self.engine.manual_trigger(motivation_id).await
    }

    /// Internal-timer mode: engine loop, dispatcher loop, and (when
    /// enabled) the webhook ingress, until [`Orchestrator::shutdown`].
    pub async fn run(&self) -> Result<()> {
        let Some(outcomes) = self.outcome_rx.lock().take() else {
            bail!("orchestrator is already running");
        };

        let engine = self.engine.clone();
        let engine_shutdown = self.shutdown_tx.subscribe();
        let engine_task = tokio::spawn(async move {
            engine.run(engine_shutdown).await;
        });

        let dispatcher = self.dispatcher.clone();
        let dispatcher_shutdown = self.shutdown_tx.subscribe();
        let dispatcher_task = tokio::spawn(async move {
            dispatcher.run(dispatcher_shutdown, outcomes).await;
        });

        let webhook = self.config.webhook();
        let webhook_task = if webhook.enabled {
            let state = WebhookState {
                store: self.store.clone(),
                bus: self.bus.clone(),
                secret: webhook.secret.clone(),
            };
            let bind_addr = webhook.bind_addr.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        tracing::error!(bind_addr = %bind_addr, error = %e, "webhook bind failed");
                        return;
                    }
                };
                tracing::info!(bind_addr = %bind_addr, "webhook ingress listening");
                let server = axum::serve(listener, webhook::router(state));
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                });
                if let Err(e) = graceful.await {
                    tracing::error!(error = %e, "webhook server error");
                }
            }))
        } else {
            None
        };

        tracing::info!("orchestrator running");
        let _ = engine_task.await;
        let _ = dispatcher_task.await;
        if let Some(task) = webhook_task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Stop the loops and cancel in-flight work.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.pool.shutdown();
        tracing::info!("orchestrator shutdown requested");
    }

    /// Snapshot for operators: idleness plus bus health.
    pub async fn idle_snapshot(&self) -> Result<crate::state::idle::IdleSnapshot> {
        let agents = self.store.agents().await?;
        let beads = self.store.beads().await?;
        Ok(self.idle.snapshot(&agents, &beads, chrono::Utc::now()))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, ProviderError, Usage,
    };
    use async_trait::async_trait;

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
                    message: ChatMessage::assistant("ok"),
                }],
                usage: Usage::default(),
            })
        }
    }

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.engine = Some(crate::config::EngineSection {
            register_builtins: false,
            ..crate::config::EngineSection::default()
        });
        config
    }

    #[test]
    fn spec_registration_round_trip() {
        let orchestrator = Orchestrator::new(quiet_config()).unwrap();

        let receipt = orchestrator
            .register_motivation(MotivationSpec {
                name: "Deadline watch".into(),
                description: None,
                kind: MotivationKind::Calendar,
                condition: Condition::DeadlineApproach,
                agent_role: Some("project-manager".into()),
                agent_id: None,
                project_id: None,
                parameters: HashMap::from([("days_threshold".into(), serde_json::json!(7))]),
                cooldown_seconds: 7200,
                priority: 85,
                create_bead_on_trigger: false,
                wake_agent: true,
            })
            .unwrap();

        assert_eq!(receipt.status, MotivationStatus::Active);
        let stored = orchestrator.registry().get(&receipt.id).unwrap();
        assert_eq!(stored.cooldown, Duration::from_secs(7200));
        assert_eq!(stored.priority, 85);
    }

    #[test]
    fn spec_with_both_wake_targets_is_rejected() {
        let orchestrator = Orchestrator::new(quiet_config()).unwrap();

        let result = orchestrator.register_motivation(MotivationSpec {
            name: "Ambiguous".into(),
            description: None,
            kind: MotivationKind::Idle,
            condition: Condition::SystemIdle,
            agent_role: Some("ceo".into()),
            agent_id: Some("agt-1".into()),
            project_id: None,
            parameters: HashMap::new(),
            cooldown_seconds: 60,
            priority: 50,
            create_bead_on_trigger: false,
            wake_agent: true,
        });
        assert!(matches!(result, Err(RegistryError::Validation(_))));
    }

    #[test]
    fn spec_kind_condition_mismatch_is_rejected() {
        let orchestrator = Orchestrator::new(quiet_config()).unwrap();

        let result = orchestrator.register_motivation(MotivationSpec {
            name: "Mismatch".into(),
            description: None,
            kind: MotivationKind::Calendar,
            condition: Condition::SystemIdle,
            agent_role: None,
            agent_id: None,
            project_id: None,
            parameters: HashMap::new(),
            cooldown_seconds: 60,
            priority: 50,
            create_bead_on_trigger: false,
            wake_agent: false,
        });
        assert!(matches!(result, Err(RegistryError::Validation(_))));
    }

    #[tokio::test]
    async fn register_agent_requires_known_provider() {
        let orchestrator = Orchestrator::new(quiet_config()).unwrap();

        let agent = Agent::new("ada", "qa-engineer", "proj-1", "missing");
        assert!(orchestrator.register_agent(agent).await.is_err());

        orchestrator.register_provider("echo", Arc::new(EchoProvider));
        let agent = Agent::new("ada", "qa-engineer", "proj-1", "echo");
        orchestrator.register_agent(agent.clone()).await.unwrap();

        assert!(orchestrator.store().agent(&agent.id).await.unwrap().is_some());
        assert_eq!(orchestrator.pool().worker_count(), 1);
    }

    #[test]
    fn builtins_load_by_default() {
        let orchestrator = Orchestrator::new(Config::default()).unwrap();
        assert!(orchestrator.registry().count() >= 30);
    }
}
