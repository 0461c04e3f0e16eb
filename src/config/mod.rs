//! Configuration system
//!
//! Layered loading, highest precedence last:
//! - Global config (`~/.config/beadwork/config.toml`)
//! - Project config (`./beadwork.toml`)
//! - Environment variables (`BEADWORK_*`) for secrets
//!
//! Layers merge rather than replace: a later layer only overrides what it
//! actually sets.  Scalar options win when present, provider entries are
//! unioned, and a section table wins only when the file carries it.

use crate::dispatch::DispatchConfig;
use crate::motivation::EngineConfig;
use crate::state::idle::IdleConfig;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Provider used for agents that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,

    /// Default model (looked up in the token-limit table as-is).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    // Section tables are optional so merging can tell "absent" from
    // "present with defaults"; read them through the accessors below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle: Option<IdleSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSection>,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// API key; normally injected via `BEADWORK_<PROVIDER>_API_KEY`.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_seconds: u64,
    #[serde(default = "default_cooldown")]
    pub default_cooldown_seconds: u64,
    #[serde(default = "default_max_triggers")]
    pub max_triggers_per_tick: usize,
    #[serde(default = "default_true")]
    pub enabled_by_default: bool,
    /// Load the built-in motivation catalog at startup.
    #[serde(default = "default_true")]
    pub register_builtins: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            evaluation_interval_seconds: default_evaluation_interval(),
            default_cooldown_seconds: default_cooldown(),
            max_triggers_per_tick: default_max_triggers(),
            enabled_by_default: true,
            register_builtins: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_dispatch_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_dispatch_interval(),
            retry_cap: default_retry_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleSection {
    #[serde(default = "default_system_idle_minutes")]
    pub system_idle_minutes: u64,
    #[serde(default = "default_project_idle_minutes")]
    pub project_idle_minutes: u64,
    #[serde(default = "default_agent_idle_minutes")]
    pub agent_idle_minutes: u64,
}

impl Default for IdleSection {
    fn default() -> Self {
        Self {
            system_idle_minutes: default_system_idle_minutes(),
            project_idle_minutes: default_project_idle_minutes(),
            agent_idle_minutes: default_agent_idle_minutes(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WebhookSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_webhook_bind")]
    pub bind_addr: String,
    /// Shared secret for signature checks; prefer `BEADWORK_WEBHOOK_SECRET`.
    #[serde(default)]
    pub secret: Option<String>,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_webhook_bind(),
            secret: None,
        }
    }
}

impl std::fmt::Debug for WebhookSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSection")
            .field("enabled", &self.enabled)
            .field("bind_addr", &self.bind_addr)
            .field("secret", &self.secret.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

fn default_evaluation_interval() -> u64 {
    60
}
fn default_cooldown() -> u64 {
    3600
}
fn default_max_triggers() -> usize {
    10
}
fn default_dispatch_interval() -> u64 {
    10
}
fn default_retry_cap() -> u32 {
    3
}
fn default_max_parallel() -> usize {
    4
}
fn default_ttl_hours() -> i64 {
    24
}
fn default_temperature() -> f32 {
    0.7
}
fn default_system_idle_minutes() -> u64 {
    30
}
fn default_project_idle_minutes() -> u64 {
    15
}
fn default_agent_idle_minutes() -> u64 {
    5
}
fn default_webhook_bind() -> String {
    "127.0.0.1:8710".to_string()
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load the layered configuration.
    pub async fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(path) = Self::global_path() {
            if let Some(global) = Self::read_file(&path).await? {
                config = config.merge(global);
            }
        }
        if let Some(project) = Self::read_file(&PathBuf::from("beadwork.toml")).await? {
            config = config.merge(project);
        }

        config.apply_env();
        Ok(config)
    }

    pub fn global_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "beadwork", "beadwork")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    async fn read_file(path: &PathBuf) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(config))
    }

    /// Merge two configs (other takes precedence).  Only fields the other
    /// layer actually set are taken: scalar options when Some, section
    /// tables when present, and provider entries are unioned.
    fn merge(mut self, other: Self) -> Self {
        if other.default_provider.is_some() {
            self.default_provider = other.default_provider;
        }
        if other.default_model.is_some() {
            self.default_model = other.default_model;
        }
        self.providers.extend(other.providers);
        if other.engine.is_some() {
            self.engine = other.engine;
        }
        if other.dispatch.is_some() {
            self.dispatch = other.dispatch;
        }
        if other.pool.is_some() {
            self.pool = other.pool;
        }
        if other.session.is_some() {
            self.session = other.session;
        }
        if other.idle.is_some() {
            self.idle = other.idle;
        }
        if other.webhook.is_some() {
            self.webhook = other.webhook;
        }
        self
    }

    /// Environment overrides: `BEADWORK_WEBHOOK_SECRET` and per-provider
    /// `BEADWORK_<NAME>_API_KEY`.
    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var("BEADWORK_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                self.webhook
                    .get_or_insert_with(WebhookSection::default)
                    .secret = Some(secret);
            }
        }
        for (name, provider) in self.providers.iter_mut() {
            let var = format!("BEADWORK_{}_API_KEY", name.to_uppercase().replace('-', "_"));
            if let Ok(key) = std::env::var(&var) {
                if !key.is_empty() {
                    provider.api_key = Some(key);
                }
            }
        }
    }

    // Section accessors: the section's values when the file set them,
    // compiled-in defaults otherwise.

    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    pub fn dispatch(&self) -> DispatchSection {
        self.dispatch.clone().unwrap_or_default()
    }

    pub fn pool(&self) -> PoolSection {
        self.pool.clone().unwrap_or_default()
    }

    pub fn session(&self) -> SessionSection {
        self.session.clone().unwrap_or_default()
    }

    pub fn idle(&self) -> IdleSection {
        self.idle.clone().unwrap_or_default()
    }

    pub fn webhook(&self) -> WebhookSection {
        self.webhook.clone().unwrap_or_default()
    }

    pub fn engine_config(&self) -> EngineConfig {
        let engine = self.engine();
        EngineConfig {
            evaluation_interval: Duration::from_secs(engine.evaluation_interval_seconds),
            default_cooldown: Duration::from_secs(engine.default_cooldown_seconds.max(1)),
            max_triggers_per_tick: engine.max_triggers_per_tick,
            enabled_by_default: engine.enabled_by_default,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let dispatch = self.dispatch();
        DispatchConfig {
            interval: Duration::from_secs(dispatch.interval_seconds.max(1)),
            retry_cap: dispatch.retry_cap.max(1),
        }
    }

    pub fn idle_config(&self) -> IdleConfig {
        let idle = self.idle();
        IdleConfig {
            system_idle_threshold: Duration::from_secs(idle.system_idle_minutes * 60),
            project_idle_threshold: Duration::from_secs(idle.project_idle_minutes * 60),
            agent_idle_threshold: Duration::from_secs(idle.agent_idle_minutes * 60),
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session().ttl_hours.max(1))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
