//! Shared world state: beads, agents, personas, and external events
//!
//! These are the entities the engine, dispatcher, and workers all operate
//! on.  The mutable store lives in [`store`]; read-only projections used by
//! the evaluators live in [`provider`].

pub mod idle;
pub mod milestone;
pub mod provider;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

// ─── Beads ───────────────────────────────────────────────────────────────

/// Bead priority, P0 highest.  Ordering follows the variant order so that
/// an ascending sort puts P0 first.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
    P4,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "p0",
            Priority::P1 => "p1",
            Priority::P2 => "p2",
            Priority::P3 => "p3",
            Priority::P4 => "p4",
        }
    }

    /// Map a 0–100 motivation priority onto a bead priority band.
    pub fn from_motivation_priority(priority: u8) -> Self {
        match priority {
            90..=100 => Priority::P0,
            70..=89 => Priority::P1,
            40..=69 => Priority::P2,
            20..=39 => Priority::P3,
            _ => Priority::P4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Closed,
    Blocked,
}

impl BeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeadStatus::Open => "open",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Closed => "closed",
            BeadStatus::Blocked => "blocked",
        }
    }
}

/// A unit of work.
///
/// A bead with a non-empty `blocked_by` set is ineligible for dispatch until
/// every blocker is Closed.  A bead in InProgress always has exactly one
/// assignee; the claim/release paths in [`store::StateStore`] maintain that
/// invariant together with the owning agent's `current_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub project_id: String,
    /// Free-form type tag ("bug", "release", "decision", "stimulus", ...).
    pub kind: String,
    pub priority: Priority,
    pub status: BeadStatus,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Role required to work this bead; empty means any capability match.
    #[serde(default)]
    pub required_role: Option<String>,
    /// Capability tag consulted when no role is required.
    #[serde(default)]
    pub required_capability: Option<String>,
    /// Provider failures observed while executing this bead.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bead {
    pub fn new(
        title: impl Into<String>,
        project_id: impl Into<String>,
        kind: impl Into<String>,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("bd-{}", Uuid::new_v4()),
            title: title.into(),
            description: String::new(),
            project_id: project_id.into(),
            kind: kind.into(),
            priority,
            status: BeadStatus::Open,
            assigned_to: None,
            due_date: None,
            blocked_by: BTreeSet::new(),
            tags: Vec::new(),
            required_role: None,
            required_capability: None,
            retry_count: 0,
            error_note: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Days until the due date, negative when overdue.  `None` when no due
    /// date is set.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.due_date
            .map(|due| (due - now).num_hours().div_euclid(24))
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, BeadStatus::Open | BeadStatus::InProgress | BeadStatus::Blocked)
            && self.due_date.is_some_and(|due| due < now)
    }
}

// ─── Agents ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    Paused,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
        }
    }
}

/// The persona document bound to an agent.  Parsing persona markdown is an
/// external concern; the orchestrator consumes the already-structured form.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub character: String,
    #[serde(default)]
    pub mission: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub autonomy_instructions: String,
    #[serde(default)]
    pub decision_instructions: String,
}

/// A persona-bound worker identity.
///
/// An agent in Working has exactly one outstanding task; `current_task` is
/// set and cleared co-atomically with the owning bead's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub persona: Persona,
    pub role: String,
    pub status: AgentStatus,
    pub project_id: String,
    #[serde(default)]
    pub current_task: Option<String>,
    pub last_active: DateTime<Utc>,
    /// Key into the provider registry this agent completes against.
    pub provider_id: String,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        project_id: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: format!("agt-{}", Uuid::new_v4()),
            persona: Persona {
                name: name.clone(),
                ..Persona::default()
            },
            name,
            role: role.into(),
            status: AgentStatus::Idle,
            project_id: project_id.into(),
            current_task: None,
            last_active: Utc::now(),
            provider_id: provider_id.into(),
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.persona
            .capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }
}

// ─── External events ─────────────────────────────────────────────────────

/// A webhook-ingested item consumed by the External evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub id: String,
    /// Event kind tag, e.g. `github_issue_opened`, `webhook`.
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

impl ExternalEvent {
    pub fn new(kind: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            kind: kind.into(),
            source: source.into(),
            data: HashMap::new(),
            timestamp: Utc::now(),
            processed: false,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn priority_orders_p0_first() {
        let mut priorities = vec![Priority::P3, Priority::P0, Priority::P2];
        priorities.sort();
        assert_eq!(priorities[0], Priority::P0);
        assert_eq!(priorities[2], Priority::P3);
    }

    #[test]
    fn motivation_priority_maps_to_bands() {
        assert_eq!(Priority::from_motivation_priority(95), Priority::P0);
        assert_eq!(Priority::from_motivation_priority(70), Priority::P1);
        assert_eq!(Priority::from_motivation_priority(50), Priority::P2);
        assert_eq!(Priority::from_motivation_priority(25), Priority::P3);
        assert_eq!(Priority::from_motivation_priority(5), Priority::P4);
    }

    #[test]
    fn bead_days_remaining() {
        let now = Utc::now();
        let mut bead = Bead::new("ship it", "proj-1", "release", Priority::P1);
        assert_eq!(bead.days_remaining(now), None);

        bead.due_date = Some(now + Duration::days(3));
        assert_eq!(bead.days_remaining(now), Some(3));

        bead.due_date = Some(now - Duration::days(2));
        assert!(bead.is_overdue(now));
        assert!(bead.days_remaining(now).unwrap() < 0);
    }

    #[test]
    fn closed_bead_is_not_overdue() {
        let now = Utc::now();
        let mut bead = Bead::new("done", "proj-1", "bug", Priority::P2);
        bead.due_date = Some(now - Duration::days(1));
        bead.status = BeadStatus::Closed;
        assert!(!bead.is_overdue(now));
    }

    #[test]
    fn agent_capability_lookup_is_case_insensitive() {
        let mut agent = Agent::new("ada", "engineering-manager", "proj-1", "openai");
        agent.persona.capabilities = vec!["code-review".into(), "Planning".into()];
        assert!(agent.has_capability("planning"));
        assert!(agent.has_capability("code-review"));
        assert!(!agent.has_capability("deploys"));
    }
}
