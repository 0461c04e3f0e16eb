//! Idle detection
//!
//! Tracks the last observed agent, bead, and per-project activity and turns
//! those timestamps into system/project idleness answers for the Idle
//! evaluators.

use crate::state::{Agent, AgentStatus, Bead, BeadStatus};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IdleConfig {
    /// How long the entire system must be quiet before it counts as idle.
    pub system_idle_threshold: std::time::Duration,
    /// How long a project must be quiet before it counts as idle.
    pub project_idle_threshold: std::time::Duration,
    /// How long an agent must be quiet before it counts as available.
    pub agent_idle_threshold: std::time::Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            system_idle_threshold: std::time::Duration::from_secs(30 * 60),
            project_idle_threshold: std::time::Duration::from_secs(15 * 60),
            agent_idle_threshold: std::time::Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
struct ActivityLog {
    last_agent_work: DateTime<Utc>,
    last_bead_activity: DateTime<Utc>,
    last_project_activity: HashMap<String, DateTime<Utc>>,
}

/// Monitors activity and answers idleness queries.
#[derive(Debug)]
pub struct IdleDetector {
    config: IdleConfig,
    started_at: DateTime<Utc>,
    log: RwLock<ActivityLog>,
}

impl IdleDetector {
    pub fn new(config: IdleConfig) -> Self {
        let now = Utc::now();
        Self {
            config,
            started_at: now,
            log: RwLock::new(ActivityLog {
                last_agent_work: now,
                last_bead_activity: now,
                last_project_activity: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> IdleConfig {
        self.config
    }

    pub fn record_agent_activity(&self, project_id: &str) {
        let now = Utc::now();
        let mut log = self.log.write();
        log.last_agent_work = now;
        if !project_id.is_empty() {
            log.last_project_activity.insert(project_id.to_string(), now);
        }
    }

    pub fn record_bead_activity(&self, project_id: &str) {
        let now = Utc::now();
        let mut log = self.log.write();
        log.last_bead_activity = now;
        if !project_id.is_empty() {
            log.last_project_activity.insert(project_id.to_string(), now);
        }
    }

    /// System is idle when no agent is working and the quiet period has
    /// lasted at least `threshold`.
    pub fn is_system_idle(
        &self,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
        working_agents: usize,
    ) -> bool {
        if working_agents > 0 {
            return false;
        }
        let last = self.log.read().last_agent_work;
        now - last >= Duration::from_std(threshold).unwrap_or(Duration::MAX)
    }

    /// A project is idle when nothing has touched it for `threshold`.
    /// Projects never seen count from detector start.
    pub fn is_project_idle(
        &self,
        project_id: &str,
        now: DateTime<Utc>,
        threshold: std::time::Duration,
    ) -> bool {
        let last = self
            .log
            .read()
            .last_project_activity
            .get(project_id)
            .copied()
            .unwrap_or(self.started_at);
        now - last >= Duration::from_std(threshold).unwrap_or(Duration::MAX)
    }

    /// Agents in Idle state that have been quiet for the agent threshold.
    pub fn idle_agent_ids(&self, agents: &[Agent], now: DateTime<Utc>) -> Vec<String> {
        let threshold =
            Duration::from_std(self.config.agent_idle_threshold).unwrap_or(Duration::MAX);
        agents
            .iter()
            .filter(|a| a.status == AgentStatus::Idle && now - a.last_active >= threshold)
            .map(|a| a.id.clone())
            .collect()
    }

    /// Aggregate view used by operators and the housekeeping motivations.
    pub fn snapshot(&self, agents: &[Agent], beads: &[Bead], now: DateTime<Utc>) -> IdleSnapshot {
        let log = self.log.read();
        let working = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Working)
            .count();
        let idle = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .count();
        let paused = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Paused)
            .count();

        let system_idle_period = now - log.last_agent_work;
        let is_system_idle = working == 0
            && system_idle_period
                >= Duration::from_std(self.config.system_idle_threshold).unwrap_or(Duration::MAX);

        IdleSnapshot {
            is_system_idle,
            system_idle_seconds: system_idle_period.num_seconds().max(0),
            total_agents: agents.len(),
            working_agents: working,
            idle_agents: idle,
            paused_agents: paused,
            total_beads: beads.len(),
            open_beads: beads
                .iter()
                .filter(|b| b.status == BeadStatus::Open)
                .count(),
            in_progress_beads: beads
                .iter()
                .filter(|b| b.status == BeadStatus::InProgress)
                .count(),
            last_agent_activity: log.last_agent_work,
            last_bead_activity: log.last_bead_activity,
            checked_at: now,
        }
    }
}

/// Point-in-time idle state of the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleSnapshot {
    pub is_system_idle: bool,
    pub system_idle_seconds: i64,
    pub total_agents: usize,
    pub working_agents: usize,
    pub idle_agents: usize,
    pub paused_agents: usize,
    pub total_beads: usize,
    pub open_beads: usize,
    pub in_progress_beads: usize,
    pub last_agent_activity: DateTime<Utc>,
    pub last_bead_activity: DateTime<Utc>,
    pub checked_at: DateTime<Utc>,
}
