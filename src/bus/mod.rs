//! Single-process event bus
//!
//! Topic-less pub/sub feeding dispatch wake-ups and observers.  Publishing
//! never blocks: each subscriber owns a bounded queue (default 256) and the
//! oldest entries are dropped on overflow, counted on the bus.  Delivery is
//! FIFO per subscriber; there is no cross-subscriber ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default per-subscriber queue size.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Event types the core produces and consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    MotivationFired,
    BeadCreated,
    BeadStatusChanged,
    BeadClosed,
    AgentStatusChanged,
    SystemIdle,
    DeadlineApproaching,
    DeadlinePassed,
    ConfigUpdated,
    DispatcherTrigger,
    ExternalGithubIssue,
    ExternalGithubPr,
    ExternalGithubComment,
    ExternalRelease,
    ExternalWebhook,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::MotivationFired => "motivation.fired",
            EventType::BeadCreated => "bead.created",
            EventType::BeadStatusChanged => "bead.status_changed",
            EventType::BeadClosed => "bead.closed",
            EventType::AgentStatusChanged => "agent.status_changed",
            EventType::SystemIdle => "system.idle",
            EventType::DeadlineApproaching => "deadline.approaching",
            EventType::DeadlinePassed => "deadline.passed",
            EventType::ConfigUpdated => "config.updated",
            EventType::DispatcherTrigger => "dispatcher.trigger",
            EventType::ExternalGithubIssue => "external.github_issue",
            EventType::ExternalGithubPr => "external.github_pr",
            EventType::ExternalGithubComment => "external.github_comment",
            EventType::ExternalRelease => "external.release",
            EventType::ExternalWebhook => "external.webhook",
            EventType::Other(s) => s,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "motivation.fired" => EventType::MotivationFired,
            "bead.created" => EventType::BeadCreated,
            "bead.status_changed" => EventType::BeadStatusChanged,
            "bead.closed" => EventType::BeadClosed,
            "agent.status_changed" => EventType::AgentStatusChanged,
            "system.idle" => EventType::SystemIdle,
            "deadline.approaching" => EventType::DeadlineApproaching,
            "deadline.passed" => EventType::DeadlinePassed,
            "config.updated" => EventType::ConfigUpdated,
            "dispatcher.trigger" => EventType::DispatcherTrigger,
            "external.github_issue" => EventType::ExternalGithubIssue,
            "external.github_pr" => EventType::ExternalGithubPr,
            "external.github_comment" => EventType::ExternalGithubComment,
            "external.release" => EventType::ExternalRelease,
            "external.webhook" => EventType::ExternalWebhook,
            _ => EventType::Other(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

/// One event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub source: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Monotonic publish order, assigned by the bus.
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        Self {
            event_type,
            source: source.into(),
            project_id: None,
            data: HashMap::new(),
            sequence: 0,
            published_at: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// The in-process bus.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    sequence: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Publish an event.  Non-blocking; returns the assigned sequence
    /// number.  With no subscribers the event is silently discarded.
    pub fn publish(&self, mut event: Event) -> u64 {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        event.sequence = seq;
        event.published_at = Utc::now();
        let _ = self.tx.send(event);
        seq
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        Subscription {
            bus: Arc::clone(self),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events lost to slow subscribers across the bus lifetime.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscriber's bounded queue.
pub struct Subscription {
    bus: Arc<EventBus>,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event, in publish order.  Skips over entries this subscriber
    /// lost to overflow, bumping the bus drop counter.  `None` when the bus
    /// is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.bus.record_dropped(n);
                    tracing::warn!(skipped = n, "event subscriber lagged, oldest entries dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.bus.record_dropped(n);
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────
