//! Motivation registry
//!
//! Authoritative store of motivation definitions plus cooldown bookkeeping
//! and the bounded trigger history.  One internal lock guards everything:
//! readers share it, mutators take it exclusively.  Role/project listings
//! are computed from the primary map rather than kept as secondary indexes,
//! so there is exactly one owner per definition.

use super::{
    EngineConfig, Motivation, MotivationFilters, MotivationStatus, MotivationTrigger,
    RegistryError, TriggerResult,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Maximum retained trigger records.
pub const TRIGGER_HISTORY_LIMIT: usize = 1_000;

#[derive(Default)]
struct Inner {
    motivations: HashMap<String, Motivation>,
    triggers: VecDeque<MotivationTrigger>,
    next_id: u64,
}

/// Fields [`Registry::update`] may change.
#[derive(Debug, Clone, Default)]
pub struct MotivationUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    pub cooldown: Option<Duration>,
    pub priority: Option<u8>,
}

pub struct Registry {
    inner: RwLock<Inner>,
    config: EngineConfig,
}

impl Registry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                motivations: HashMap::new(),
                triggers: VecDeque::with_capacity(64),
                next_id: 1,
            }),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a motivation.  Assigns an id when absent, applies the
    /// configured defaults, and stamps timestamps.  Duplicate ids and
    /// invalid definitions are rejected without state change.
    pub fn register(&self, mut motivation: Motivation) -> Result<String, RegistryError> {
        if motivation.cooldown.is_zero() {
            motivation.cooldown = self.config.default_cooldown;
        }
        motivation.validate()?;

        let mut inner = self.inner.write();
        if motivation.id.is_empty() {
            motivation.id = format!("mot-{}", inner.next_id);
            inner.next_id += 1;
        } else if inner.motivations.contains_key(&motivation.id) {
            return Err(RegistryError::Duplicate(motivation.id));
        }

        if !self.config.enabled_by_default && !motivation.is_built_in {
            motivation.status = MotivationStatus::Disabled;
        }

        let now = Utc::now();
        motivation.created_at = now;
        motivation.updated_at = now;

        let id = motivation.id.clone();
        inner.motivations.insert(id.clone(), motivation);
        tracing::debug!(motivation_id = %id, "motivation registered");
        Ok(id)
    }

    pub fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        inner
            .motivations
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Motivation, RegistryError> {
        self.inner
            .read()
            .motivations
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn list(&self, filters: Option<&MotivationFilters>) -> Vec<Motivation> {
        let inner = self.inner.read();
        let mut result: Vec<Motivation> = inner
            .motivations
            .values()
            .filter(|m| filters.is_none_or(|f| f.matches(m)))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Motivations bound to `role`, plus the global ones with no role.
    pub fn list_by_role(&self, role: &str) -> Vec<Motivation> {
        let inner = self.inner.read();
        let mut result: Vec<Motivation> = inner
            .motivations
            .values()
            .filter(|m| m.agent_role.is_none() || m.agent_role.as_deref() == Some(role))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// Motivations scoped to `project_id`, plus the global ones with no
    /// project.
    pub fn list_by_project(&self, project_id: &str) -> Vec<Motivation> {
        let inner = self.inner.read();
        let mut result: Vec<Motivation> = inner
            .motivations
            .values()
            .filter(|m| {
                m.project_id.is_none()
                    || (!project_id.is_empty() && m.project_id.as_deref() == Some(project_id))
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    /// The active set, in stable registry order.
    pub fn get_active(&self) -> Vec<Motivation> {
        let inner = self.inner.read();
        let mut result: Vec<Motivation> = inner
            .motivations
            .values()
            .filter(|m| m.status == MotivationStatus::Active)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    pub fn enable(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let m = inner
            .motivations
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        m.status = MotivationStatus::Active;
        m.disabled_at = None;
        m.updated_at = Utc::now();
        Ok(())
    }

    pub fn disable(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let m = inner
            .motivations
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let now = Utc::now();
        m.status = MotivationStatus::Disabled;
        m.disabled_at = Some(now);
        m.updated_at = now;
        Ok(())
    }

    /// Apply a whitelisted partial update.
    pub fn update(&self, id: &str, update: MotivationUpdate) -> Result<(), RegistryError> {
        if let Some(priority) = update.priority {
            if priority > 100 {
                return Err(RegistryError::Validation(format!(
                    "priority {priority} out of range (0-100)"
                )));
            }
        }
        if update.cooldown.is_some_and(|c| c.is_zero()) {
            return Err(RegistryError::Validation(
                "cooldown must be positive".into(),
            ));
        }

        let mut inner = self.inner.write();
        let m = inner
            .motivations
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if let Some(name) = update.name {
            m.name = name;
        }
        if let Some(description) = update.description {
            m.description = description;
        }
        if let Some(parameters) = update.parameters {
            m.parameters = parameters;
        }
        if let Some(cooldown) = update.cooldown {
            m.cooldown = cooldown;
        }
        if let Some(priority) = update.priority {
            m.priority = priority;
        }
        m.updated_at = Utc::now();
        Ok(())
    }

    /// Record a firing: stamps the motivation, arms the cooldown on
    /// success, and appends to the bounded history.
    pub fn record_trigger(&self, trigger: MotivationTrigger) {
        let mut inner = self.inner.write();

        if let Some(m) = inner.motivations.get_mut(&trigger.motivation_id) {
            m.last_triggered_at = Some(trigger.triggered_at);
            m.trigger_count += 1;
            m.updated_at = Utc::now();
            if trigger.result == TriggerResult::Success {
                m.status = MotivationStatus::Cooldown;
            }
        }

        inner.triggers.push_back(trigger);
        while inner.triggers.len() > TRIGGER_HISTORY_LIMIT {
            inner.triggers.pop_front();
        }
    }

    /// Most recent trigger records, oldest first.  `limit` of 0 means all.
    pub fn trigger_history(&self, limit: usize) -> Vec<MotivationTrigger> {
        let inner = self.inner.read();
        let len = inner.triggers.len();
        let take = if limit == 0 || limit > len { len } else { limit };
        inner
            .triggers
            .iter()
            .skip(len - take)
            .cloned()
            .collect()
    }

    /// Return motivations whose cooldown has elapsed to Active.
    pub fn check_cooldowns(&self) {
        let now = Utc::now();
        let mut inner = self.inner.write();
        for m in inner.motivations.values_mut() {
            if m.status == MotivationStatus::Cooldown {
                if let Some(last) = m.last_triggered_at {
                    let elapsed = (now - last).to_std().unwrap_or_default();
                    if elapsed >= m.cooldown {
                        m.status = MotivationStatus::Active;
                        m.updated_at = now;
                    }
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        self.inner.read().motivations.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
