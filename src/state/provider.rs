//! Read-only projections of system state
//!
//! [`StateProvider`] is the evaluators' and dispatcher's window onto the
//! world.  Each query observes a single consistent snapshot; consistency
//! across calls is not promised and the engine tolerates inter-call skew.

use crate::state::idle::IdleDetector;
use crate::state::milestone::{Milestone, Urgency};
use crate::state::store::StateStore;
use crate::state::{AgentStatus, Bead, BeadStatus, ExternalEvent};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Deadline projection for a bead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeadDeadline {
    pub bead_id: String,
    pub title: String,
    pub project_id: String,
    pub due_date: DateTime<Utc>,
    pub days_remaining: i64,
    pub urgency: Urgency,
}

impl BeadDeadline {
    fn from_bead(bead: &Bead, now: DateTime<Utc>) -> Option<Self> {
        let due_date = bead.due_date?;
        let days_remaining = bead.days_remaining(now)?;
        Some(Self {
            bead_id: bead.id.clone(),
            title: bead.title.clone(),
            project_id: bead.project_id.clone(),
            due_date,
            days_remaining,
            urgency: Urgency::from_days_remaining(days_remaining),
        })
    }
}

/// Read-only queries the evaluators are written against.
#[async_trait]
pub trait StateProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn beads_with_upcoming_deadlines(&self, within_days: i64) -> Result<Vec<BeadDeadline>>;
    async fn overdue_beads(&self) -> Result<Vec<BeadDeadline>>;
    async fn beads_by_status(&self, status: BeadStatus) -> Result<Vec<String>>;

    async fn milestones(&self, project_id: Option<&str>) -> Result<Vec<Milestone>>;
    async fn upcoming_milestones(&self, within_days: i64) -> Result<Vec<Milestone>>;

    async fn idle_agents(&self) -> Result<Vec<String>>;
    async fn agents_by_role(&self, role: &str) -> Result<Vec<String>>;

    async fn is_project_idle(&self, project_id: &str, threshold: std::time::Duration)
        -> Result<bool>;
    async fn is_system_idle(&self, threshold: std::time::Duration) -> Result<bool>;

    async fn current_spending(&self, period: &str) -> Result<f64>;
    async fn budget_threshold(&self, project_id: &str) -> Result<Option<f64>>;

    /// Open decision-type beads awaiting a call.
    async fn pending_decisions(&self) -> Result<Vec<String>>;

    async fn unprocessed_external_events(&self, kind: &str) -> Result<Vec<ExternalEvent>>;
}

// ─── Store-backed provider ───────────────────────────────────────────────

/// The production [`StateProvider`]: projects straight off the store, with
/// idleness answered by the [`IdleDetector`].
pub struct StoreStateProvider {
    store: Arc<dyn StateStore>,
    idle: Arc<IdleDetector>,
}

impl StoreStateProvider {
    pub fn new(store: Arc<dyn StateStore>, idle: Arc<IdleDetector>) -> Self {
        Self { store, idle }
    }

    async fn working_agent_count(&self) -> Result<usize> {
        Ok(self
            .store
            .agents()
            .await?
            .iter()
            .filter(|a| a.status == AgentStatus::Working)
            .count())
    }
}

#[async_trait]
impl StateProvider for StoreStateProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn beads_with_upcoming_deadlines(&self, within_days: i64) -> Result<Vec<BeadDeadline>> {
        let now = self.now();
        let mut deadlines: Vec<BeadDeadline> = self
            .store
            .beads()
            .await?
            .iter()
            .filter(|b| matches!(b.status, BeadStatus::Open | BeadStatus::InProgress))
            .filter_map(|b| BeadDeadline::from_bead(b, now))
            .filter(|d| d.days_remaining >= 0 && d.days_remaining <= within_days)
            .collect();
        deadlines.sort_by_key(|d| d.due_date);
        Ok(deadlines)
    }

    async fn overdue_beads(&self) -> Result<Vec<BeadDeadline>> {
        let now = self.now();
        let mut overdue: Vec<BeadDeadline> = self
            .store
            .beads()
            .await?
            .iter()
            .filter(|b| b.is_overdue(now))
            .filter_map(|b| BeadDeadline::from_bead(b, now))
            .collect();
        overdue.sort_by_key(|d| d.due_date);
        Ok(overdue)
    }

    async fn beads_by_status(&self, status: BeadStatus) -> Result<Vec<String>> {
        Ok(self
            .store
            .beads_by_status(status)
            .await?
            .into_iter()
            .map(|b| b.id)
            .collect())
    }

    async fn milestones(&self, project_id: Option<&str>) -> Result<Vec<Milestone>> {
        self.store.milestones(project_id).await
    }

    async fn upcoming_milestones(&self, within_days: i64) -> Result<Vec<Milestone>> {
        let now = self.now();
        let mut upcoming: Vec<Milestone> = self
            .store
            .milestones(None)
            .await?
            .into_iter()
            .filter(|m| {
                !matches!(
                    m.status,
                    crate::state::milestone::MilestoneStatus::Complete
                        | crate::state::milestone::MilestoneStatus::Cancelled
                ) && {
                    let days = m.days_remaining(now);
                    days >= 0 && days <= within_days
                }
            })
            .collect();
        upcoming.sort_by_key(|m| m.due_date);
        Ok(upcoming)
    }

    async fn idle_agents(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .agents()
            .await?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .map(|a| a.id)
            .collect())
    }

    async fn agents_by_role(&self, role: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .agents()
            .await?
            .into_iter()
            .filter(|a| a.role == role)
            .map(|a| a.id)
            .collect())
    }

    async fn is_project_idle(
        &self,
        project_id: &str,
        threshold: std::time::Duration,
    ) -> Result<bool> {
        Ok(self.idle.is_project_idle(project_id, self.now(), threshold))
    }

    async fn is_system_idle(&self, threshold: std::time::Duration) -> Result<bool> {
        let working = self.working_agent_count().await?;
        Ok(self.idle.is_system_idle(self.now(), threshold, working))
    }

    async fn current_spending(&self, period: &str) -> Result<f64> {
        self.store.spending(period).await
    }

    async fn budget_threshold(&self, project_id: &str) -> Result<Option<f64>> {
        self.store.budget_threshold(project_id).await
    }

    async fn pending_decisions(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .beads_by_status(BeadStatus::Open)
            .await?
            .into_iter()
            .filter(|b| b.kind == "decision")
            .map(|b| b.id)
            .collect())
    }

    async fn unprocessed_external_events(&self, kind: &str) -> Result<Vec<ExternalEvent>> {
        self.store.unprocessed_external_events(kind).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::idle::IdleConfig;
    use crate::state::store::MemoryStore;
    use crate::state::{Agent, Priority};
    use chrono::Duration;

    async fn provider_with_store() -> (StoreStateProvider, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let idle = Arc::new(IdleDetector::new(IdleConfig::default()));
        (
            StoreStateProvider::new(store.clone(), idle),
            store,
        )
    }

    #[tokio::test]
    async fn upcoming_deadlines_window() {
        let (provider, store) = provider_with_store().await;
        let now = Utc::now();

        let mut soon = Bead::new("soon", "proj-1", "release", Priority::P1);
        soon.due_date = Some(now + Duration::days(3));
        let mut far = Bead::new("far", "proj-1", "release", Priority::P1);
        far.due_date = Some(now + Duration::days(45));
        let mut past = Bead::new("past", "proj-1", "release", Priority::P1);
        past.due_date = Some(now - Duration::days(2));
        let undated = Bead::new("undated", "proj-1", "bug", Priority::P2);

        for bead in [soon.clone(), far, past.clone(), undated] {
            store.create_bead(bead).await.unwrap();
        }

        let upcoming = provider.beads_with_upcoming_deadlines(7).await.unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].bead_id, soon.id);
        assert_eq!(upcoming[0].urgency, Urgency::Critical);

        let overdue = provider.overdue_beads().await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].bead_id, past.id);
        assert!(overdue[0].days_remaining < 0);
    }

    #[tokio::test]
    async fn pending_decisions_are_open_decision_beads() {
        let (provider, store) = provider_with_store().await;

        let decision = Bead::new("choose db", "proj-1", "decision", Priority::P0);
        let mut closed_decision = Bead::new("old call", "proj-1", "decision", Priority::P0);
        closed_decision.status = BeadStatus::Closed;
        let bug = Bead::new("fix", "proj-1", "bug", Priority::P2);

        store.create_bead(decision.clone()).await.unwrap();
        store.create_bead(closed_decision).await.unwrap();
        store.create_bead(bug).await.unwrap();

        assert_eq!(provider.pending_decisions().await.unwrap(), vec![decision.id]);
    }

    #[tokio::test]
    async fn agent_queries() {
        let (provider, store) = provider_with_store().await;

        let idle_pm = Agent::new("pm", "project-manager", "proj-1", "openai");
        let mut busy_pm = Agent::new("pm2", "project-manager", "proj-1", "openai");
        busy_pm.status = AgentStatus::Working;
        let ceo = Agent::new("ceo", "ceo", "proj-1", "openai");

        store.create_agent(idle_pm.clone()).await.unwrap();
        store.create_agent(busy_pm.clone()).await.unwrap();
        store.create_agent(ceo.clone()).await.unwrap();

        let mut idle = provider.idle_agents().await.unwrap();
        idle.sort();
        let mut expected = vec![idle_pm.id.clone(), ceo.id.clone()];
        expected.sort();
        assert_eq!(idle, expected);

        let mut pms = provider.agents_by_role("project-manager").await.unwrap();
        pms.sort();
        let mut expected_pms = vec![idle_pm.id, busy_pm.id];
        expected_pms.sort();
        assert_eq!(pms, expected_pms);
    }

    #[tokio::test]
    async fn upcoming_milestones_window() {
        use crate::state::milestone::{Milestone, MilestoneKind, MilestoneStatus};

        let (provider, store) = provider_with_store().await;
        let now = Utc::now();

        let near = Milestone::new("beta", "proj-1", MilestoneKind::Release, now + Duration::days(5));
        let far = Milestone::new("ga", "proj-1", MilestoneKind::Release, now + Duration::days(60));
        let mut done = Milestone::new(
            "alpha",
            "proj-2",
            MilestoneKind::SprintEnd,
            now + Duration::days(2),
        );
        done.status = MilestoneStatus::Complete;

        for ms in [near.clone(), far, done] {
            store.create_milestone(ms).await.unwrap();
        }

        let upcoming = provider.upcoming_milestones(14).await.unwrap();
        // Completed milestones drop out; the far one is outside the window.
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].id, near.id);

        let scoped = provider.milestones(Some("proj-1")).await.unwrap();
        assert_eq!(scoped.len(), 2);
    }

    #[tokio::test]
    async fn system_idle_blocked_by_working_agent() {
        let (provider, store) = provider_with_store().await;
        let mut busy = Agent::new("w", "ceo", "proj-1", "openai");
        busy.status = AgentStatus::Working;
        store.create_agent(busy).await.unwrap();

        assert!(!provider
            .is_system_idle(std::time::Duration::ZERO)
            .await
            .unwrap());
    }
}
