//! Project milestones and deadline urgency

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneKind {
    Release,
    SprintEnd,
    QuarterlyReview,
    AnnualReview,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Planned,
    InProgress,
    Complete,
    Missed,
    Cancelled,
}

/// Deadline urgency bands used by the calendar evaluator and the deadline
/// projections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// More than 30 days out.
    None,
    /// 15–30 days.
    Low,
    /// 8–14 days.
    Medium,
    /// 4–7 days.
    High,
    /// 3 days or less, or overdue.
    Critical,
}

impl Urgency {
    pub fn from_days_remaining(days: i64) -> Self {
        if days <= 3 {
            Urgency::Critical
        } else if days <= 7 {
            Urgency::High
        } else if days <= 14 {
            Urgency::Medium
        } else if days <= 30 {
            Urgency::Low
        } else {
            Urgency::None
        }
    }
}

/// A project milestone with a due date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: MilestoneKind,
    pub status: MilestoneStatus,
    pub due_date: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Beads that roll up into this milestone.
    #[serde(default)]
    pub bead_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Milestone {
    pub fn new(
        name: impl Into<String>,
        project_id: impl Into<String>,
        kind: MilestoneKind,
        due_date: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("ms-{}", Uuid::new_v4()),
            project_id: project_id.into(),
            name: name.into(),
            description: String::new(),
            kind,
            status: MilestoneStatus::Planned,
            due_date,
            completed_at: None,
            bead_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Days until the due date, negative when overdue.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.due_date - now).num_hours().div_euclid(24)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.due_date < now
            && !matches!(
                self.status,
                MilestoneStatus::Complete | MilestoneStatus::Cancelled
            )
    }

    pub fn urgency(&self, now: DateTime<Utc>) -> Urgency {
        if matches!(
            self.status,
            MilestoneStatus::Complete | MilestoneStatus::Cancelled
        ) {
            return Urgency::None;
        }
        Urgency::from_days_remaining(self.days_remaining(now))
    }
}

/// Completion rollup for a milestone's beads.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MilestoneProgress {
    pub milestone_id: String,
    pub total_beads: usize,
    pub completed_beads: usize,
    pub in_progress_beads: usize,
    pub blocked_beads: usize,
    pub percent_complete: f64,
}

impl MilestoneProgress {
    pub fn recalculate(&mut self) {
        self.percent_complete = if self.total_beads == 0 {
            100.0
        } else {
            self.completed_beads as f64 / self.total_beads as f64 * 100.0
        };
    }
}
