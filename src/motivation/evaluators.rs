//! Condition evaluators
//!
//! One pure function per motivation family: `(motivation, state) →
//! Option<trigger-data>`.  Evaluators never write, never create beads, and
//! never publish events; firing is entirely the engine's business.

use super::{Condition, Motivation, MotivationKind};
use crate::state::idle::IdleConfig;
use crate::state::provider::StateProvider;
use anyhow::{bail, Result};
use chrono::Datelike;
use serde_json::json;
use std::collections::HashMap;

/// Opaque data recorded on the trigger when a condition fires.
pub type TriggerData = HashMap<String, serde_json::Value>;

/// Evaluate a motivation against the current state snapshot.  Returns
/// `Some(data)` when the condition fires.  The idle configuration supplies
/// the scope-specific fallback thresholds for Idle motivations that carry
/// no `idle_duration` parameter.
pub async fn evaluate(
    motivation: &Motivation,
    state: &dyn StateProvider,
    idle: IdleConfig,
) -> Result<Option<TriggerData>> {
    match motivation.kind {
        MotivationKind::Calendar => evaluate_calendar(motivation, state).await,
        MotivationKind::Event => evaluate_event(motivation, state).await,
        MotivationKind::Threshold => evaluate_threshold(motivation, state).await,
        MotivationKind::Idle => evaluate_idle(motivation, state, idle).await,
        MotivationKind::External => evaluate_external(motivation, state).await,
    }
}

async fn evaluate_calendar(
    m: &Motivation,
    state: &dyn StateProvider,
) -> Result<Option<TriggerData>> {
    let now = state.now();
    let mut data = TriggerData::new();

    match m.condition {
        Condition::TimeReached => {
            if let Some(at) = m.next_trigger_at {
                if now > at {
                    data.insert("scheduled_time".into(), json!(at));
                    return Ok(Some(data));
                }
            }
        }

        Condition::DeadlineApproach => {
            let days_threshold = m.param_i64("days_threshold").unwrap_or(7);
            let beads = state.beads_with_upcoming_deadlines(days_threshold).await?;
            if !beads.is_empty() {
                data.insert("count".into(), json!(beads.len()));
                data.insert("days_threshold".into(), json!(days_threshold));
                data.insert("approaching_deadlines".into(), serde_json::to_value(&beads)?);
                return Ok(Some(data));
            }
        }

        Condition::DeadlinePassed => {
            let beads = state.overdue_beads().await?;
            if !beads.is_empty() {
                data.insert("count".into(), json!(beads.len()));
                data.insert("overdue_beads".into(), serde_json::to_value(&beads)?);
                return Ok(Some(data));
            }
        }

        Condition::ScheduledInterval => {
            // Never fired yet: fire immediately.
            let Some(last) = m.last_triggered_at else {
                return Ok(Some(data));
            };
            // The cooldown stands in when no interval parameter is given.
            let interval = m.param_duration("interval").unwrap_or(m.cooldown);
            if (now - last).to_std().unwrap_or_default() >= interval {
                data.insert(
                    "interval".into(),
                    json!(humantime::format_duration(interval).to_string()),
                );
                data.insert("last_triggered".into(), json!(last));
                return Ok(Some(data));
            }
        }

        Condition::QuarterBoundary => {
            let is_quarter_start =
                matches!(now.month(), 1 | 4 | 7 | 10) && now.day() <= 7;
            let past_guard = m
                .last_triggered_at
                .is_none_or(|last| now - last > chrono::Duration::days(80));
            if is_quarter_start && past_guard {
                data.insert("quarter".into(), json!((now.month() - 1) / 3 + 1));
                data.insert("year".into(), json!(now.year()));
                return Ok(Some(data));
            }
        }

        Condition::MonthBoundary => {
            let is_month_start = now.day() <= 3;
            let past_guard = m
                .last_triggered_at
                .is_none_or(|last| now - last > chrono::Duration::days(25));
            if is_month_start && past_guard {
                data.insert("month".into(), json!(now.month()));
                data.insert("year".into(), json!(now.year()));
                return Ok(Some(data));
            }
        }

        other => bail!("condition {other:?} is not a calendar condition"),
    }

    Ok(None)
}

async fn evaluate_event(m: &Motivation, state: &dyn StateProvider) -> Result<Option<TriggerData>> {
    match m.condition {
        Condition::DecisionPending => {
            let decisions = state.pending_decisions().await?;
            if decisions.is_empty() {
                return Ok(None);
            }
            let mut data = TriggerData::new();
            data.insert("count".into(), json!(decisions.len()));
            data.insert("pending_decisions".into(), json!(decisions));
            Ok(Some(data))
        }

        // Bus-driven conditions never fire under polling; the engine reacts
        // to the corresponding bus events instead.
        Condition::BeadCreated
        | Condition::BeadStatusChanged
        | Condition::BeadCompleted
        | Condition::ReleasePublished => Ok(None),

        other => bail!("condition {other:?} is not an event condition"),
    }
}

async fn evaluate_threshold(
    m: &Motivation,
    state: &dyn StateProvider,
) -> Result<Option<TriggerData>> {
    match m.condition {
        Condition::CostExceeded => {
            let period = m.param_str("period").unwrap_or("daily");
            let spending = state.current_spending(period).await?;
            let project = m.project_id.as_deref().unwrap_or("");
            let Some(threshold) = state.budget_threshold(project).await? else {
                return Ok(None);
            };
            if spending > threshold {
                let mut data = TriggerData::new();
                data.insert("current_spending".into(), json!(spending));
                data.insert("threshold".into(), json!(threshold));
                data.insert("period".into(), json!(period));
                data.insert("overage".into(), json!(spending - threshold));
                return Ok(Some(data));
            }
            Ok(None)
        }

        // Reserved: these need CI/coverage/velocity feeds and arrive as
        // events when they do.
        Condition::CoverageDropped | Condition::TestFailure | Condition::VelocityDrop => Ok(None),

        other => bail!("condition {other:?} is not a threshold condition"),
    }
}

async fn evaluate_idle(
    m: &Motivation,
    state: &dyn StateProvider,
    idle: IdleConfig,
) -> Result<Option<TriggerData>> {
    let mut data = TriggerData::new();

    match m.condition {
        Condition::SystemIdle => {
            let threshold = m
                .param_duration("idle_duration")
                .unwrap_or(idle.system_idle_threshold);
            if state.is_system_idle(threshold).await? {
                data.insert(
                    "idle_duration".into(),
                    json!(humantime::format_duration(threshold).to_string()),
                );
                data.insert("scope".into(), json!("system"));
                return Ok(Some(data));
            }
        }

        Condition::AgentIdle => {
            let Some(role) = m.agent_role.as_deref() else {
                return Ok(None);
            };
            let of_role = state.agents_by_role(role).await?;
            let idle_ids = state.idle_agents().await?;
            let idle_of_role: Vec<&String> =
                of_role.iter().filter(|a| idle_ids.contains(a)).collect();
            if !idle_of_role.is_empty() {
                data.insert("idle_agents".into(), json!(idle_of_role));
                data.insert("role".into(), json!(role));
                return Ok(Some(data));
            }
        }

        Condition::ProjectIdle => {
            let Some(project_id) = m.project_id.as_deref() else {
                return Ok(None);
            };
            let threshold = m
                .param_duration("idle_duration")
                .unwrap_or(idle.project_idle_threshold);
            if state.is_project_idle(project_id, threshold).await? {
                data.insert("project_id".into(), json!(project_id));
                data.insert(
                    "idle_duration".into(),
                    json!(humantime::format_duration(threshold).to_string()),
                );
                return Ok(Some(data));
            }
        }

        other => bail!("condition {other:?} is not an idle condition"),
    }

    Ok(None)
}

async fn evaluate_external(
    m: &Motivation,
    state: &dyn StateProvider,
) -> Result<Option<TriggerData>> {
    let event_kind = match m.condition {
        Condition::GithubIssueOpened => "github_issue_opened".to_string(),
        Condition::GithubCommentAdded => "github_comment_added".to_string(),
        Condition::GithubPrOpened => "github_pr_opened".to_string(),
        Condition::WebhookReceived => m
            .param_str("webhook_type")
            .unwrap_or("webhook")
            .to_string(),
        other => bail!("condition {other:?} is not an external condition"),
    };

    let events = state.unprocessed_external_events(&event_kind).await?;
    if events.is_empty() {
        return Ok(None);
    }

    let mut data = TriggerData::new();
    data.insert("event_type".into(), json!(event_kind));
    data.insert("count".into(), json!(events.len()));
    data.insert("events".into(), serde_json::to_value(&events)?);
    Ok(Some(data))
}

// ─── Tests ───────────────────────────────────────────────────────────────
