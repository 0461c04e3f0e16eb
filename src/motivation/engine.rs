//! Motivation engine
//!
//! Drives the evaluate-and-fire cycle.  A tick advances cooldowns, walks
//! the active set in registry order, evaluates each motivation, and fires
//! at most `max_triggers_per_tick` of them; the rest wait for the next
//! tick.  The host picks the clock: [`Engine::run`] owns an internal timer,
//! while an external scheduler (a durable workflow heartbeat, a test) can
//! call [`Engine::tick`] directly; both share the same semantics.

use super::evaluators::{self, TriggerData};
use super::registry::Registry;
use super::{EngineConfig, Motivation, MotivationTrigger, RegistryError, TriggerResult};
use crate::actions::ActionHandler;
use crate::state::idle::IdleConfig;
use crate::state::provider::StateProvider;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of one tick, also the payload handed back to heartbeat hosts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TickReport {
    pub evaluated: usize,
    pub fired: usize,
    #[serde(default)]
    pub fired_motivation_ids: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

pub struct Engine {
    registry: Arc<Registry>,
    state: Arc<dyn StateProvider>,
    actions: Arc<dyn ActionHandler>,
    config: EngineConfig,
    /// Scope-specific idle fallbacks for motivations without an
    /// `idle_duration` parameter.
    idle: IdleConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<Registry>,
        state: Arc<dyn StateProvider>,
        actions: Arc<dyn ActionHandler>,
    ) -> Self {
        let config = registry.config().clone();
        Self {
            registry,
            state,
            actions,
            config,
            idle: IdleConfig::default(),
        }
    }

    pub fn with_idle_config(mut self, idle: IdleConfig) -> Self {
        self.idle = idle;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// One evaluation cycle.
    pub async fn tick(&self) -> TickReport {
        self.tick_with_cancel(&CancellationToken::new()).await
    }

    /// One evaluation cycle under a cancellation token.  Cancellation stops
    /// between motivations; nothing half-fired is left behind.
    pub async fn tick_with_cancel(&self, cancel: &CancellationToken) -> TickReport {
        self.registry.check_cooldowns();

        let active = self.registry.get_active();
        let mut report = TickReport {
            evaluated: active.len(),
            ..TickReport::default()
        };
        if active.is_empty() {
            return report;
        }

        for motivation in active {
            if cancel.is_cancelled() {
                tracing::debug!("tick cancelled, deferring remaining motivations");
                break;
            }
            if report.fired >= self.config.max_triggers_per_tick {
                tracing::debug!(
                    cap = self.config.max_triggers_per_tick,
                    "max triggers per tick reached, deferring remaining"
                );
                break;
            }

            let data = match evaluators::evaluate(&motivation, self.state.as_ref(), self.idle)
                .await
            {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    // Transient evaluator failure: skip this motivation, do
                    // not arm its cooldown, keep the tick going.
                    tracing::warn!(motivation_id = %motivation.id, error = %e, "evaluator error");
                    report.errors.push(format!("{}: {e}", motivation.id));
                    continue;
                }
            };

            let trigger = self.fire(&motivation, data).await;
            report.fired += 1;
            report.fired_motivation_ids.push(trigger.motivation_id);
        }

        if report.fired > 0 {
            tracing::info!(
                evaluated = report.evaluated,
                fired = report.fired,
                "motivation tick"
            );
        }
        report
    }

    /// Fire a motivation: materialize the actions, publish, and record.
    /// Action failures land on the trigger record, not on the caller.
    async fn fire(&self, motivation: &Motivation, trigger_data: TriggerData) -> MotivationTrigger {
        let mut trigger = MotivationTrigger {
            id: format!("trig-{}", Uuid::new_v4()),
            motivation_id: motivation.id.clone(),
            motivation_name: motivation.name.clone(),
            condition: motivation.condition,
            triggered_at: Utc::now(),
            trigger_data,
            result: TriggerResult::Success,
            bead_created: None,
            agent_woken: None,
            error: None,
        };

        if motivation.create_bead_on_trigger {
            match self
                .actions
                .create_stimulus_bead(motivation, &trigger.trigger_data)
                .await
            {
                Ok(bead_id) => trigger.bead_created = Some(bead_id),
                Err(e) => {
                    trigger.result = TriggerResult::Error;
                    trigger.error = Some(e.to_string());
                }
            }
        }

        if motivation.wake_agent && trigger.result == TriggerResult::Success {
            if let Some(agent_id) = motivation.agent_id.as_deref() {
                match self.actions.wake_agent(agent_id, motivation).await {
                    Ok(()) => trigger.agent_woken = Some(agent_id.to_string()),
                    Err(e) => {
                        // Wake failure does not flip the trigger result.
                        tracing::warn!(agent_id, error = %e, "failed to wake agent");
                    }
                }
            } else if let Some(role) = motivation.agent_role.as_deref() {
                if let Err(e) = self.actions.wake_agents_by_role(role, motivation).await {
                    tracing::warn!(role, error = %e, "failed to wake agents by role");
                }
            }
        }

        if let Err(e) = self.actions.publish_motivation_fired(&trigger).await {
            tracing::warn!(error = %e, "failed to publish motivation.fired");
        }

        self.registry.record_trigger(trigger.clone());
        tracing::info!(
            motivation_id = %motivation.id,
            name = %motivation.name,
            result = ?trigger.result,
            "motivation fired"
        );
        trigger
    }

    /// Fire a motivation by id regardless of its cooldown state.
    pub async fn manual_trigger(&self, id: &str) -> Result<MotivationTrigger, RegistryError> {
        let motivation = self.registry.get(id)?;
        let mut data = TriggerData::new();
        data.insert("manual".into(), serde_json::json!(true));
        Ok(self.fire(&motivation, data).await)
    }

    /// Internal-timer mode: tick on `evaluation_interval` until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.evaluation_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // consume the immediate first tick

        tracing::info!(
            interval = ?self.config.evaluation_interval,
            "motivation engine started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("motivation engine stopped");
                        return;
                    }
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motivation::{Condition, MotivationStatus};
    use crate::state::milestone::Milestone;
    use crate::state::provider::BeadDeadline;
    use crate::state::{BeadStatus, ExternalEvent};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::DateTime;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeState {
        system_idle: Mutex<bool>,
        decisions: Mutex<Vec<String>>,
        upcoming: Mutex<Vec<BeadDeadline>>,
        spending: Mutex<f64>,
        budget: Mutex<Option<f64>>,
    }

    #[async_trait]
    impl StateProvider for FakeState {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
        async fn beads_with_upcoming_deadlines(&self, _: i64) -> Result<Vec<BeadDeadline>> {
            Ok(self.upcoming.lock().clone())
        }
        async fn overdue_beads(&self) -> Result<Vec<BeadDeadline>> {
            Ok(vec![])
        }
        async fn beads_by_status(&self, _: BeadStatus) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn milestones(&self, _: Option<&str>) -> Result<Vec<Milestone>> {
            Ok(vec![])
        }
        async fn upcoming_milestones(&self, _: i64) -> Result<Vec<Milestone>> {
            Ok(vec![])
        }
        async fn idle_agents(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn agents_by_role(&self, _: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn is_project_idle(&self, _: &str, _: Duration) -> Result<bool> {
            Ok(false)
        }
        async fn is_system_idle(&self, _: Duration) -> Result<bool> {
            Ok(*self.system_idle.lock())
        }
        async fn current_spending(&self, _: &str) -> Result<f64> {
            Ok(*self.spending.lock())
        }
        async fn budget_threshold(&self, _: &str) -> Result<Option<f64>> {
            Ok(*self.budget.lock())
        }
        async fn pending_decisions(&self) -> Result<Vec<String>> {
            Ok(self.decisions.lock().clone())
        }
        async fn unprocessed_external_events(&self, _: &str) -> Result<Vec<ExternalEvent>> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct RecordingActions {
        beads_created: Mutex<Vec<String>>,
        agents_woken: Mutex<Vec<String>>,
        roles_woken: Mutex<Vec<String>>,
        published: Mutex<Vec<MotivationTrigger>>,
        fail_bead_creation: Mutex<bool>,
    }

    #[async_trait]
    impl ActionHandler for RecordingActions {
        async fn create_stimulus_bead(
            &self,
            motivation: &Motivation,
            _data: &TriggerData,
        ) -> Result<String> {
            if *self.fail_bead_creation.lock() {
                anyhow::bail!("store unavailable");
            }
            let id = format!("bd-stimulus-{}", motivation.id);
            self.beads_created.lock().push(id.clone());
            Ok(id)
        }
        async fn wake_agent(&self, agent_id: &str, _m: &Motivation) -> Result<()> {
            self.agents_woken.lock().push(agent_id.to_string());
            Ok(())
        }
        async fn wake_agents_by_role(&self, role: &str, _m: &Motivation) -> Result<()> {
            self.roles_woken.lock().push(role.to_string());
            Ok(())
        }
        async fn publish_motivation_fired(&self, trigger: &MotivationTrigger) -> Result<()> {
            self.published.lock().push(trigger.clone());
            Ok(())
        }
        async fn start_workflow(&self, kind: &str, _input: serde_json::Value) -> Result<String> {
            Ok(format!("wf-{kind}"))
        }
    }

    fn engine_with(
        config: EngineConfig,
        state: Arc<FakeState>,
        actions: Arc<RecordingActions>,
    ) -> (Engine, Arc<Registry>) {
        let registry = Arc::new(Registry::new(config));
        let engine = Engine::new(registry.clone(), state, actions);
        (engine, registry)
    }

    fn short_config() -> EngineConfig {
        EngineConfig {
            evaluation_interval: Duration::from_millis(100),
            default_cooldown: Duration::from_millis(50),
            max_triggers_per_tick: 10,
            enabled_by_default: true,
        }
    }

    #[tokio::test]
    async fn deadline_approach_wakes_role() {
        let state = Arc::new(FakeState::default());
        state.upcoming.lock().push(BeadDeadline {
            bead_id: "bd-1".into(),
            title: "Important Task".into(),
            project_id: "proj-1".into(),
            due_date: Utc::now() + chrono::Duration::days(3),
            days_remaining: 3,
            urgency: crate::state::milestone::Urgency::Critical,
        });
        let actions = Arc::new(RecordingActions::default());
        let (engine, registry) = engine_with(short_config(), state, actions.clone());

        registry
            .register(
                Motivation::new("Deadline Approaching", Condition::DeadlineApproach)
                    .for_role("project-manager")
                    .wakes_agent()
                    .with_cooldown(Duration::from_secs(7200))
                    .with_parameter("days_threshold", serde_json::json!(7)),
            )
            .unwrap();

        let report = engine.tick().await;
        assert_eq!(report.fired, 1);
        assert_eq!(*actions.roles_woken.lock(), vec!["project-manager"]);
        assert_eq!(actions.published.lock().len(), 1);

        let history = registry.trigger_history(0);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result, TriggerResult::Success);
    }

    #[tokio::test]
    async fn cooldown_prevents_retrigger_until_elapsed() {
        let state = Arc::new(FakeState::default());
        *state.system_idle.lock() = true;
        let actions = Arc::new(RecordingActions::default());
        let mut config = short_config();
        config.default_cooldown = Duration::from_millis(150);
        let (engine, registry) = engine_with(config, state, actions);

        let mut m = Motivation::new("System Idle", Condition::SystemIdle)
            .for_role("ceo")
            .wakes_agent();
        m.cooldown = Duration::ZERO; // take the registry default
        registry.register(m).unwrap();

        assert_eq!(engine.tick().await.fired, 1);
        // Immediately after: in cooldown.
        assert_eq!(engine.tick().await.fired, 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.tick().await.fired, 1);
    }

    #[tokio::test]
    async fn cost_exceeded_creates_bead() {
        let state = Arc::new(FakeState::default());
        *state.spending.lock() = 150.0;
        *state.budget.lock() = Some(100.0);
        let actions = Arc::new(RecordingActions::default());
        let (engine, registry) = engine_with(short_config(), state, actions.clone());

        registry
            .register(
                Motivation::new("Cost Exceeded", Condition::CostExceeded)
                    .for_role("cfo")
                    .wakes_agent()
                    .creates_bead()
                    .with_parameter("period", serde_json::json!("daily")),
            )
            .unwrap();

        let report = engine.tick().await;
        assert_eq!(report.fired, 1);
        assert_eq!(actions.beads_created.lock().len(), 1);

        let history = registry.trigger_history(0);
        assert!(history[0].bead_created.is_some());
    }

    #[tokio::test]
    async fn max_triggers_per_tick_defers_the_rest() {
        let state = Arc::new(FakeState::default());
        *state.system_idle.lock() = true;
        state.decisions.lock().push("bd-d1".into());
        state.upcoming.lock().push(BeadDeadline {
            bead_id: "bd-1".into(),
            title: "t".into(),
            project_id: "proj-1".into(),
            due_date: Utc::now() + chrono::Duration::days(3),
            days_remaining: 3,
            urgency: crate::state::milestone::Urgency::Critical,
        });
        let actions = Arc::new(RecordingActions::default());
        let mut config = short_config();
        config.max_triggers_per_tick = 2;
        let (engine, registry) = engine_with(config, state, actions);

        registry
            .register(
                Motivation::new("M1", Condition::SystemIdle)
                    .for_role("ceo")
                    .wakes_agent(),
            )
            .unwrap();
        registry
            .register(
                Motivation::new("M2", Condition::DecisionPending)
                    .for_role("ceo")
                    .wakes_agent(),
            )
            .unwrap();
        registry
            .register(
                Motivation::new("M3", Condition::DeadlineApproach)
                    .for_role("project-manager")
                    .wakes_agent()
                    .with_parameter("days_threshold", serde_json::json!(30)),
            )
            .unwrap();

        let report = engine.tick().await;
        assert_eq!(report.fired, 2);

        // The deferred motivation is still Active, not in cooldown.
        let statuses: Vec<MotivationStatus> = registry
            .list(None)
            .into_iter()
            .map(|m| m.status)
            .collect();
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == MotivationStatus::Active)
                .count(),
            1
        );
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == MotivationStatus::Cooldown)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn bead_creation_failure_marks_trigger_and_skips_wake() {
        let state = Arc::new(FakeState::default());
        *state.system_idle.lock() = true;
        let actions = Arc::new(RecordingActions::default());
        *actions.fail_bead_creation.lock() = true;
        let (engine, registry) = engine_with(short_config(), state, actions.clone());

        registry
            .register(
                Motivation::new("Doomed", Condition::SystemIdle)
                    .for_role("ceo")
                    .wakes_agent()
                    .creates_bead(),
            )
            .unwrap();

        engine.tick().await;

        let history = registry.trigger_history(0);
        assert_eq!(history[0].result, TriggerResult::Error);
        assert!(history[0].error.as_deref().unwrap().contains("store unavailable"));
        // Wake was skipped but the fired event still went out.
        assert!(actions.roles_woken.lock().is_empty());
        assert_eq!(actions.published.lock().len(), 1);
        // An errored trigger does not arm the cooldown.
        let m = &registry.list(None)[0];
        assert_eq!(m.status, MotivationStatus::Active);
    }

    #[tokio::test]
    async fn manual_trigger_bypasses_cooldown() {
        let state = Arc::new(FakeState::default());
        *state.system_idle.lock() = true;
        let actions = Arc::new(RecordingActions::default());
        let (engine, registry) = engine_with(short_config(), state, actions);

        let id = registry
            .register(
                Motivation::new("System Idle", Condition::SystemIdle)
                    .for_role("ceo")
                    .wakes_agent()
                    .with_cooldown(Duration::from_secs(4 * 3600)),
            )
            .unwrap();

        assert_eq!(engine.tick().await.fired, 1);
        assert_eq!(
            registry.get(&id).unwrap().status,
            MotivationStatus::Cooldown
        );

        let trigger = engine.manual_trigger(&id).await.unwrap();
        assert_eq!(trigger.result, TriggerResult::Success);
        assert_eq!(trigger.trigger_data["manual"], serde_json::json!(true));
        assert_eq!(registry.trigger_history(0).len(), 2);
    }

    #[tokio::test]
    async fn manual_trigger_unknown_id_is_not_found() {
        let state = Arc::new(FakeState::default());
        let actions = Arc::new(RecordingActions::default());
        let (engine, _) = engine_with(short_config(), state, actions);

        assert!(matches!(
            engine.manual_trigger("mot-ghost").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn non_firing_motivations_are_evaluated_and_skipped() {
        let state = Arc::new(FakeState::default());
        *state.system_idle.lock() = true;
        let actions = Arc::new(RecordingActions::default());
        let (engine, registry) = engine_with(short_config(), state, actions);

        registry
            .register(
                Motivation::new("No deadlines", Condition::DeadlineApproach)
                    .with_id("mot-a")
                    .for_role("project-manager"),
            )
            .unwrap();
        registry
            .register(
                Motivation::new("Idle", Condition::SystemIdle)
                    .with_id("mot-b")
                    .for_role("ceo")
                    .wakes_agent(),
            )
            .unwrap();

        let report = engine.tick().await;
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.fired, 1);
        assert_eq!(report.fired_motivation_ids, vec!["mot-b"]);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn cancelled_tick_defers_everything() {
        let state = Arc::new(FakeState::default());
        *state.system_idle.lock() = true;
        let actions = Arc::new(RecordingActions::default());
        let (engine, registry) = engine_with(short_config(), state, actions);

        registry
            .register(
                Motivation::new("Idle", Condition::SystemIdle)
                    .for_role("ceo")
                    .wakes_agent(),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine.tick_with_cancel(&cancel).await;
        assert_eq!(report.fired, 0);
        assert_eq!(registry.trigger_history(0).len(), 0);
        // Nothing armed: next tick fires normally.
        assert_eq!(engine.tick().await.fired, 1);
    }
}
