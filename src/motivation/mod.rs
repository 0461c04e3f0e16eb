//! Motivations: declarative wake-up rules
//!
//! A motivation pairs a condition with an action policy (create a stimulus
//! bead, wake an agent or a role) and a cooldown.  The registry owns the
//! definitions; the engine evaluates the active set every tick.

pub mod defaults;
pub mod engine;
pub mod evaluators;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// The five evaluator families.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MotivationKind {
    Calendar,
    Event,
    Threshold,
    Idle,
    External,
}

/// The exhaustive set of conditions the evaluators recognise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    // Calendar
    TimeReached,
    DeadlineApproach,
    DeadlinePassed,
    /// Fires when `interval` (or the cooldown, when the parameter is
    /// absent) has elapsed since the last trigger.
    ScheduledInterval,
    QuarterBoundary,
    MonthBoundary,
    // Event
    DecisionPending,
    BeadCreated,
    BeadStatusChanged,
    BeadCompleted,
    ReleasePublished,
    // Threshold
    CostExceeded,
    CoverageDropped,
    TestFailure,
    VelocityDrop,
    // Idle
    SystemIdle,
    AgentIdle,
    ProjectIdle,
    // External
    GithubIssueOpened,
    GithubCommentAdded,
    GithubPrOpened,
    WebhookReceived,
}

impl Condition {
    /// The evaluator family this condition belongs to.
    pub fn kind(&self) -> MotivationKind {
        use Condition::*;
        match self {
            TimeReached | DeadlineApproach | DeadlinePassed | ScheduledInterval
            | QuarterBoundary | MonthBoundary => MotivationKind::Calendar,
            DecisionPending | BeadCreated | BeadStatusChanged | BeadCompleted
            | ReleasePublished => MotivationKind::Event,
            CostExceeded | CoverageDropped | TestFailure | VelocityDrop => {
                MotivationKind::Threshold
            }
            SystemIdle | AgentIdle | ProjectIdle => MotivationKind::Idle,
            GithubIssueOpened | GithubCommentAdded | GithubPrOpened | WebhookReceived => {
                MotivationKind::External
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MotivationStatus {
    #[default]
    Active,
    Cooldown,
    Disabled,
}

/// A declarative wake-up rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Motivation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: MotivationKind,
    pub condition: Condition,
    /// Wake target: at most one of `agent_id` / `agent_role` may be set.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_role: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub cooldown: Duration,
    /// 0–100, higher first.
    pub priority: u8,
    #[serde(default)]
    pub status: MotivationStatus,
    #[serde(default)]
    pub create_bead_on_trigger: bool,
    #[serde(default)]
    pub wake_agent: bool,
    #[serde(default)]
    pub is_built_in: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_trigger_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_count: u64,
}

impl Motivation {
    pub fn new(name: impl Into<String>, condition: Condition) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            description: String::new(),
            kind: condition.kind(),
            condition,
            agent_id: None,
            agent_role: None,
            project_id: None,
            parameters: HashMap::new(),
            cooldown: Duration::from_secs(3600),
            priority: 50,
            status: MotivationStatus::Active,
            create_bead_on_trigger: false,
            wake_agent: false,
            is_built_in: false,
            created_at: now,
            updated_at: now,
            last_triggered_at: None,
            next_trigger_at: None,
            disabled_at: None,
            trigger_count: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn for_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = Some(role.into());
        self
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn wakes_agent(mut self) -> Self {
        self.wake_agent = true;
        self
    }

    pub fn creates_bead(mut self) -> Self {
        self.create_bead_on_trigger = true;
        self
    }

    pub fn built_in(mut self) -> Self {
        self.is_built_in = true;
        self
    }

    /// Structural validation applied at the registry boundary.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Validation("name must not be empty".into()));
        }
        if self.priority > 100 {
            return Err(RegistryError::Validation(format!(
                "priority {} out of range (0-100)",
                self.priority
            )));
        }
        if self.cooldown.is_zero() {
            return Err(RegistryError::Validation(
                "cooldown must be positive".into(),
            ));
        }
        if self.agent_id.is_some() && self.agent_role.is_some() {
            return Err(RegistryError::Validation(
                "agent_id and agent_role are mutually exclusive".into(),
            ));
        }
        if self.condition.kind() != self.kind {
            return Err(RegistryError::Validation(format!(
                "condition {:?} does not belong to type {:?}",
                self.condition, self.kind
            )));
        }
        Ok(())
    }

    // Parameter accessors.  Parameters arrive as a JSON bag; integers may
    // be encoded as numbers or strings and durations as humantime strings.

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        match self.parameters.get(key)? {
            serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key)?.as_str()
    }

    pub fn param_duration(&self, key: &str) -> Option<Duration> {
        humantime::parse_duration(self.param_str(key)?.trim()).ok()
    }
}

/// Outcome of one firing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerResult {
    Success,
    Skipped,
    Error,
    Cancelled,
}

/// Immutable record of one motivation firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotivationTrigger {
    pub id: String,
    pub motivation_id: String,
    /// Snapshot of the motivation at fire time.
    pub motivation_name: String,
    pub condition: Condition,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub trigger_data: HashMap<String, serde_json::Value>,
    pub result: TriggerResult,
    #[serde(default)]
    pub bead_created: Option<String>,
    #[serde(default)]
    pub agent_woken: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Query filters for [`registry::Registry::list`].
#[derive(Debug, Clone, Default)]
pub struct MotivationFilters {
    pub kind: Option<MotivationKind>,
    pub status: Option<MotivationStatus>,
    pub agent_role: Option<String>,
    pub project_id: Option<String>,
    pub is_built_in: Option<bool>,
}

impl MotivationFilters {
    pub fn matches(&self, m: &Motivation) -> bool {
        if self.kind.is_some_and(|k| m.kind != k) {
            return false;
        }
        if self.status.is_some_and(|s| m.status != s) {
            return false;
        }
        if self
            .agent_role
            .as_deref()
            .is_some_and(|r| m.agent_role.as_deref() != Some(r))
        {
            return false;
        }
        if self
            .project_id
            .as_deref()
            .is_some_and(|p| m.project_id.as_deref() != Some(p))
        {
            return false;
        }
        if self.is_built_in.is_some_and(|b| m.is_built_in != b) {
            return false;
        }
        true
    }
}

/// Errors surfaced at the registry boundary.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid motivation: {0}")]
    Validation(String),
    #[error("motivation not found: {0}")]
    NotFound(String),
    #[error("motivation already exists: {0}")]
    Duplicate(String),
}

/// Engine-wide tuning shared by the registry and the tick loop.  Idle
/// fallbacks are scope-specific and live in
/// [`crate::state::idle::IdleConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tick period for the internal-timer mode.
    pub evaluation_interval: Duration,
    /// Cooldown applied when a motivation is registered without one.
    pub default_cooldown: Duration,
    /// Hard cap on firings per tick; the rest defer to the next tick.
    pub max_triggers_per_tick: usize,
    /// Status assigned to registrations that do not specify one.
    pub enabled_by_default: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(60),
            default_cooldown: Duration::from_secs(3600),
            max_triggers_per_tick: 10,
            enabled_by_default: true,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
