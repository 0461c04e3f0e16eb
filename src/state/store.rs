//! Persistent-store contract and the in-memory reference implementation
//!
//! The orchestrator does not mandate an on-disk layout; it requires a
//! collaborator that durably holds beads, agents, conversations, and
//! external events and offers per-entity atomic compare-and-set on bead
//! status, agent status, and conversation append.  [`MemoryStore`] is the
//! single-process implementation: one lock over the whole world, so every
//! call observes one consistent snapshot and the claim/release paths are
//! co-atomic across the bead and its agent.

use crate::conversation::{ConversationContext, ConversationMessage};
use crate::state::milestone::Milestone;
use crate::state::{Agent, AgentStatus, Bead, BeadStatus, ExternalEvent};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Store contract consumed by the state provider, dispatcher, and workers.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Beads
    async fn create_bead(&self, bead: Bead) -> Result<()>;
    async fn bead(&self, id: &str) -> Result<Option<Bead>>;
    async fn beads(&self) -> Result<Vec<Bead>>;
    async fn beads_by_status(&self, status: BeadStatus) -> Result<Vec<Bead>>;

    /// CAS a bead's status.  Returns false on conflict or unknown id.
    async fn compare_and_set_bead_status(
        &self,
        id: &str,
        expected: BeadStatus,
        next: BeadStatus,
    ) -> Result<bool>;

    /// Atomically claim an Open, unassigned bead for an Idle agent:
    /// bead Open→InProgress with the assignee set, agent Idle→Working with
    /// `current_task` set, in one step.  Returns false on any conflict.
    async fn claim_bead(&self, bead_id: &str, agent_id: &str) -> Result<bool>;

    /// Atomically undo a claim: bead InProgress→`to` (assignee cleared,
    /// retry counter bumped when requested), agent Working→Idle with
    /// `current_task` cleared.  Returns false unless the bead is currently
    /// assigned to `agent_id`.
    async fn release_claim(
        &self,
        bead_id: &str,
        agent_id: &str,
        to: BeadStatus,
        error_note: Option<String>,
        bump_retry: bool,
    ) -> Result<bool>;

    // Agents
    async fn create_agent(&self, agent: Agent) -> Result<()>;
    async fn agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn agents(&self) -> Result<Vec<Agent>>;
    async fn compare_and_set_agent_status(
        &self,
        id: &str,
        expected: AgentStatus,
        next: AgentStatus,
    ) -> Result<bool>;
    /// Refresh an agent's last-active timestamp.
    async fn touch_agent(&self, id: &str) -> Result<bool>;

    // Conversations
    async fn conversation_by_bead(&self, bead_id: &str) -> Result<Option<ConversationContext>>;
    async fn put_conversation(&self, context: ConversationContext) -> Result<()>;
    /// CAS append: succeeds only when the stored message count still equals
    /// `expected_len`.
    async fn append_conversation(
        &self,
        session_id: &str,
        expected_len: usize,
        messages: Vec<ConversationMessage>,
    ) -> Result<bool>;

    // Milestones
    async fn create_milestone(&self, milestone: Milestone) -> Result<()>;
    async fn milestones(&self, project_id: Option<&str>) -> Result<Vec<Milestone>>;

    // External events
    async fn insert_external_event(&self, event: ExternalEvent) -> Result<()>;
    async fn unprocessed_external_events(&self, kind: &str) -> Result<Vec<ExternalEvent>>;
    async fn mark_external_events_processed(&self, ids: &[String]) -> Result<usize>;

    // Spending and budgets
    async fn add_spending(&self, period: &str, amount: f64) -> Result<()>;
    async fn spending(&self, period: &str) -> Result<f64>;
    async fn set_budget_threshold(&self, project_id: &str, amount: f64) -> Result<()>;
    /// Budget for a project, falling back to the global ("") entry.
    async fn budget_threshold(&self, project_id: &str) -> Result<Option<f64>>;
}

// ─── In-memory store ─────────────────────────────────────────────────────

#[derive(Default)]
struct World {
    beads: HashMap<String, Bead>,
    agents: HashMap<String, Agent>,
    conversations: HashMap<String, ConversationContext>,
    sessions_by_bead: HashMap<String, String>,
    milestones: HashMap<String, Milestone>,
    external_events: Vec<ExternalEvent>,
    spending: HashMap<String, f64>,
    budgets: HashMap<String, f64>,
}

/// Single-process authoritative store.
#[derive(Default)]
pub struct MemoryStore {
    world: RwLock<World>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_bead(&self, bead: Bead) -> Result<()> {
        let mut world = self.world.write();
        if world.beads.contains_key(&bead.id) {
            bail!("bead already exists: {}", bead.id);
        }
        world.beads.insert(bead.id.clone(), bead);
        Ok(())
    }

    async fn bead(&self, id: &str) -> Result<Option<Bead>> {
        Ok(self.world.read().beads.get(id).cloned())
    }

    async fn beads(&self) -> Result<Vec<Bead>> {
        Ok(self.world.read().beads.values().cloned().collect())
    }

    async fn beads_by_status(&self, status: BeadStatus) -> Result<Vec<Bead>> {
        Ok(self
            .world
            .read()
            .beads
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect())
    }

    async fn compare_and_set_bead_status(
        &self,
        id: &str,
        expected: BeadStatus,
        next: BeadStatus,
    ) -> Result<bool> {
        let mut world = self.world.write();
        match world.beads.get_mut(id) {
            Some(bead) if bead.status == expected => {
                bead.status = next;
                bead.updated_at = Utc::now();
                if next != BeadStatus::InProgress {
                    bead.assigned_to = None;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_bead(&self, bead_id: &str, agent_id: &str) -> Result<bool> {
        let mut world = self.world.write();
        let now = Utc::now();

        let claimable = matches!(
            world.beads.get(bead_id),
            Some(bead) if bead.status == BeadStatus::Open && bead.assigned_to.is_none()
        );
        let available = matches!(
            world.agents.get(agent_id),
            Some(agent) if agent.status == AgentStatus::Idle
        );
        if !claimable || !available {
            return Ok(false);
        }

        let bead = world.beads.get_mut(bead_id).expect("checked above");
        bead.status = BeadStatus::InProgress;
        bead.assigned_to = Some(agent_id.to_string());
        bead.updated_at = now;

        let agent = world.agents.get_mut(agent_id).expect("checked above");
        agent.status = AgentStatus::Working;
        agent.current_task = Some(bead_id.to_string());
        agent.last_active = now;

        Ok(true)
    }

    async fn release_claim(
        &self,
        bead_id: &str,
        agent_id: &str,
        to: BeadStatus,
        error_note: Option<String>,
        bump_retry: bool,
    ) -> Result<bool> {
        let mut world = self.world.write();
        let now = Utc::now();

        let owned = matches!(
            world.beads.get(bead_id),
            Some(bead) if bead.status == BeadStatus::InProgress
                && bead.assigned_to.as_deref() == Some(agent_id)
        );
        if !owned {
            return Ok(false);
        }

        let bead = world.beads.get_mut(bead_id).expect("checked above");
        bead.status = to;
        bead.assigned_to = None;
        bead.updated_at = now;
        if bump_retry {
            bead.retry_count += 1;
        }
        if let Some(note) = error_note {
            bead.error_note = Some(note);
        }

        if let Some(agent) = world.agents.get_mut(agent_id) {
            if agent.status == AgentStatus::Working {
                agent.status = AgentStatus::Idle;
            }
            agent.current_task = None;
            agent.last_active = now;
        }

        Ok(true)
    }

    async fn create_agent(&self, agent: Agent) -> Result<()> {
        let mut world = self.world.write();
        if world.agents.contains_key(&agent.id) {
            bail!("agent already exists: {}", agent.id);
        }
        world.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.world.read().agents.get(id).cloned())
    }

    async fn agents(&self) -> Result<Vec<Agent>> {
        Ok(self.world.read().agents.values().cloned().collect())
    }

    async fn compare_and_set_agent_status(
        &self,
        id: &str,
        expected: AgentStatus,
        next: AgentStatus,
    ) -> Result<bool> {
        let mut world = self.world.write();
        match world.agents.get_mut(id) {
            Some(agent) if agent.status == expected => {
                agent.status = next;
                agent.last_active = Utc::now();
                if next != AgentStatus::Working {
                    agent.current_task = None;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_agent(&self, id: &str) -> Result<bool> {
        let mut world = self.world.write();
        match world.agents.get_mut(id) {
            Some(agent) => {
                agent.last_active = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn conversation_by_bead(&self, bead_id: &str) -> Result<Option<ConversationContext>> {
        let world = self.world.read();
        Ok(world
            .sessions_by_bead
            .get(bead_id)
            .and_then(|sid| world.conversations.get(sid))
            .cloned())
    }

    async fn put_conversation(&self, context: ConversationContext) -> Result<()> {
        let mut world = self.world.write();
        world
            .sessions_by_bead
            .insert(context.bead_id.clone(), context.session_id.clone());
        world
            .conversations
            .insert(context.session_id.clone(), context);
        Ok(())
    }

    async fn append_conversation(
        &self,
        session_id: &str,
        expected_len: usize,
        messages: Vec<ConversationMessage>,
    ) -> Result<bool> {
        let mut world = self.world.write();
        match world.conversations.get_mut(session_id) {
            Some(context) if context.messages.len() == expected_len => {
                context.messages.extend(messages);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => bail!("conversation not found: {session_id}"),
        }
    }

    async fn create_milestone(&self, milestone: Milestone) -> Result<()> {
        let mut world = self.world.write();
        if world.milestones.contains_key(&milestone.id) {
            bail!("milestone already exists: {}", milestone.id);
        }
        world.milestones.insert(milestone.id.clone(), milestone);
        Ok(())
    }

    async fn milestones(&self, project_id: Option<&str>) -> Result<Vec<Milestone>> {
        Ok(self
            .world
            .read()
            .milestones
            .values()
            .filter(|m| project_id.is_none_or(|p| m.project_id == p))
            .cloned()
            .collect())
    }

    async fn insert_external_event(&self, event: ExternalEvent) -> Result<()> {
        self.world.write().external_events.push(event);
        Ok(())
    }

    async fn unprocessed_external_events(&self, kind: &str) -> Result<Vec<ExternalEvent>> {
        Ok(self
            .world
            .read()
            .external_events
            .iter()
            .filter(|e| !e.processed && e.kind == kind)
            .cloned()
            .collect())
    }

    async fn mark_external_events_processed(&self, ids: &[String]) -> Result<usize> {
        let mut world = self.world.write();
        let mut marked = 0;
        for event in world.external_events.iter_mut() {
            if !event.processed && ids.iter().any(|id| id == &event.id) {
                event.processed = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn add_spending(&self, period: &str, amount: f64) -> Result<()> {
        *self
            .world
            .write()
            .spending
            .entry(period.to_string())
            .or_insert(0.0) += amount;
        Ok(())
    }

    async fn spending(&self, period: &str) -> Result<f64> {
        Ok(self.world.read().spending.get(period).copied().unwrap_or(0.0))
    }

    async fn set_budget_threshold(&self, project_id: &str, amount: f64) -> Result<()> {
        self.world
            .write()
            .budgets
            .insert(project_id.to_string(), amount);
        Ok(())
    }

    async fn budget_threshold(&self, project_id: &str) -> Result<Option<f64>> {
        let world = self.world.read();
        Ok(world
            .budgets
            .get(project_id)
            .or_else(|| world.budgets.get(""))
            .copied())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
