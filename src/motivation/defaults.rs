//! Built-in motivation catalog
//!
//! Every orchestrator starts with a baseline of wake-up rules covering the
//! standard roles.  Operators can disable or tune them through the
//! registry; they are marked `is_built_in` so listings can tell them apart
//! from operator-defined rules.

use super::registry::Registry;
use super::{Condition, Motivation, RegistryError};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

fn rule(name: &str, condition: Condition, role: &str) -> Motivation {
    Motivation::new(name, condition).for_role(role).built_in()
}

/// The built-in catalog.
pub fn default_motivations() -> Vec<Motivation> {
    vec![
        // ── ceo ──
        rule("System idle review", Condition::SystemIdle, "ceo")
            .with_description("Surface strategic work when the whole system goes quiet")
            .with_parameter("idle_duration", json!("30m"))
            .with_cooldown(Duration::from_secs(4 * HOUR))
            .with_priority(70)
            .wakes_agent(),
        rule("Decision pending", Condition::DecisionPending, "ceo")
            .with_description("A decision bead is waiting for a call")
            .with_cooldown(Duration::from_secs(30 * MINUTE))
            .with_priority(95)
            .wakes_agent(),
        rule("Quarterly strategy review", Condition::QuarterBoundary, "ceo")
            .with_cooldown(Duration::from_secs(30 * DAY))
            .with_priority(80)
            .wakes_agent()
            .creates_bead(),
        // ── cfo ──
        rule("Budget exceeded", Condition::CostExceeded, "cfo")
            .with_description("Daily spend crossed the configured threshold")
            .with_parameter("period", json!("daily"))
            .with_cooldown(Duration::from_secs(HOUR))
            .with_priority(90)
            .wakes_agent()
            .creates_bead(),
        rule("Monthly financial close", Condition::MonthBoundary, "cfo")
            .with_cooldown(Duration::from_secs(20 * DAY))
            .with_priority(75)
            .wakes_agent()
            .creates_bead(),
        rule("Finance desk idle", Condition::AgentIdle, "cfo")
            .with_parameter("idle_duration", json!("1h"))
            .with_cooldown(Duration::from_secs(4 * HOUR))
            .with_priority(40)
            .wakes_agent(),
        // ── project-manager ──
        rule("Deadline approaching", Condition::DeadlineApproach, "project-manager")
            .with_description("Beads are due within the warning window")
            .with_parameter("days_threshold", json!(7))
            .with_cooldown(Duration::from_secs(2 * HOUR))
            .with_priority(85)
            .wakes_agent(),
        rule("Deadline passed", Condition::DeadlinePassed, "project-manager")
            .with_cooldown(Duration::from_secs(HOUR))
            .with_priority(95)
            .wakes_agent()
            .creates_bead(),
        rule("Daily planning sweep", Condition::ScheduledInterval, "project-manager")
            .with_parameter("interval", json!("24h"))
            .with_cooldown(Duration::from_secs(12 * HOUR))
            .with_priority(60)
            .wakes_agent(),
        rule("Velocity drop watch", Condition::VelocityDrop, "project-manager")
            .with_description("Reserved for the velocity feed; fires on events only")
            .with_cooldown(Duration::from_secs(DAY))
            .with_priority(50)
            .wakes_agent(),
        // ── engineering-manager ──
        rule("Review queue check", Condition::ScheduledInterval, "engineering-manager")
            .with_parameter("interval", json!("4h"))
            .with_cooldown(Duration::from_secs(2 * HOUR))
            .with_priority(55)
            .wakes_agent(),
        rule("Engineers idle", Condition::AgentIdle, "engineering-manager")
            .with_parameter("idle_duration", json!("30m"))
            .with_cooldown(Duration::from_secs(2 * HOUR))
            .with_priority(50)
            .wakes_agent(),
        rule("Build break triage", Condition::TestFailure, "engineering-manager")
            .with_cooldown(Duration::from_secs(30 * MINUTE))
            .with_priority(90)
            .wakes_agent()
            .creates_bead(),
        // ── qa-engineer ──
        rule("Completed work verification", Condition::BeadCompleted, "qa-engineer")
            .with_cooldown(Duration::from_secs(15 * MINUTE))
            .with_priority(70)
            .wakes_agent(),
        rule("Release deadline check", Condition::DeadlineApproach, "qa-engineer")
            .with_parameter("days_threshold", json!(3))
            .with_cooldown(Duration::from_secs(4 * HOUR))
            .with_priority(80)
            .wakes_agent(),
        rule("Test failure triage", Condition::TestFailure, "qa-engineer")
            .with_cooldown(Duration::from_secs(30 * MINUTE))
            .with_priority(90)
            .wakes_agent()
            .creates_bead(),
        // ── public-relations-manager ──
        rule("Release announcement", Condition::ReleasePublished, "public-relations-manager")
            .with_cooldown(Duration::from_secs(HOUR))
            .with_priority(75)
            .wakes_agent()
            .creates_bead(),
        rule("Community comment response", Condition::GithubCommentAdded, "public-relations-manager")
            .with_cooldown(Duration::from_secs(30 * MINUTE))
            .with_priority(65)
            .wakes_agent(),
        rule("Monthly newsletter", Condition::MonthBoundary, "public-relations-manager")
            .with_cooldown(Duration::from_secs(20 * DAY))
            .with_priority(45)
            .wakes_agent()
            .creates_bead(),
        // ── product-manager ──
        rule("New issue intake", Condition::GithubIssueOpened, "product-manager")
            .with_cooldown(Duration::from_secs(15 * MINUTE))
            .with_priority(75)
            .wakes_agent()
            .creates_bead(),
        rule("Roadmap review", Condition::QuarterBoundary, "product-manager")
            .with_cooldown(Duration::from_secs(30 * DAY))
            .with_priority(70)
            .wakes_agent()
            .creates_bead(),
        rule("Backlog grooming", Condition::ScheduledInterval, "product-manager")
            .with_parameter("interval", json!("7d"))
            .with_cooldown(Duration::from_secs(3 * DAY))
            .with_priority(50)
            .wakes_agent(),
        // ── devops-engineer ──
        rule("Pull request pipeline check", Condition::GithubPrOpened, "devops-engineer")
            .with_cooldown(Duration::from_secs(10 * MINUTE))
            .with_priority(80)
            .wakes_agent(),
        rule("Deploy webhook", Condition::WebhookReceived, "devops-engineer")
            .with_parameter("webhook_type", json!("deploy"))
            .with_cooldown(Duration::from_secs(5 * MINUTE))
            .with_priority(85)
            .wakes_agent()
            .creates_bead(),
        rule("Infra cost check", Condition::CostExceeded, "devops-engineer")
            .with_parameter("period", json!("weekly"))
            .with_cooldown(Duration::from_secs(DAY))
            .with_priority(70)
            .wakes_agent(),
        // ── documentation-manager ──
        rule("Release notes due", Condition::ReleasePublished, "documentation-manager")
            .with_cooldown(Duration::from_secs(HOUR))
            .with_priority(65)
            .wakes_agent()
            .creates_bead(),
        rule("Docs freshness sweep", Condition::ScheduledInterval, "documentation-manager")
            .with_parameter("interval", json!("7d"))
            .with_cooldown(Duration::from_secs(3 * DAY))
            .with_priority(40)
            .wakes_agent()
            .creates_bead(),
        // ── code-reviewer ──
        rule("Pull request review", Condition::GithubPrOpened, "code-reviewer")
            .with_cooldown(Duration::from_secs(15 * MINUTE))
            .with_priority(85)
            .wakes_agent(),
        rule("Reviewer idle", Condition::AgentIdle, "code-reviewer")
            .with_parameter("idle_duration", json!("1h"))
            .with_cooldown(Duration::from_secs(2 * HOUR))
            .with_priority(45)
            .wakes_agent(),
        // ── housekeeping-bot ──
        rule("Quiet-hours cleanup", Condition::SystemIdle, "housekeeping-bot")
            .with_parameter("idle_duration", json!("1h"))
            .with_cooldown(Duration::from_secs(6 * HOUR))
            .with_priority(20)
            .wakes_agent()
            .creates_bead(),
        rule("Daily housekeeping", Condition::ScheduledInterval, "housekeeping-bot")
            .with_parameter("interval", json!("24h"))
            .with_cooldown(Duration::from_secs(12 * HOUR))
            .with_priority(25)
            .wakes_agent()
            .creates_bead(),
        // ── decision-maker ──
        rule("Decision queue review", Condition::DecisionPending, "decision-maker")
            .with_cooldown(Duration::from_secs(15 * MINUTE))
            .with_priority(90)
            .wakes_agent(),
        rule("Stale decision sweep", Condition::ScheduledInterval, "decision-maker")
            .with_parameter("interval", json!("12h"))
            .with_cooldown(Duration::from_secs(6 * HOUR))
            .with_priority(60)
            .wakes_agent(),
    ]
}

/// Register the whole catalog.
pub fn register_defaults(registry: &Registry) -> Result<(), RegistryError> {
    for motivation in default_motivations() {
        registry.register(motivation)?;
    }
    Ok(())
}

/// Catalog entries bound to `role`.
pub fn motivations_for_role(role: &str) -> Vec<Motivation> {
    default_motivations()
        .into_iter()
        .filter(|m| m.agent_role.as_deref() == Some(role))
        .collect()
}

/// Every role the catalog covers, sorted.
pub fn all_roles() -> Vec<String> {
    let roles: BTreeSet<String> = default_motivations()
        .into_iter()
        .filter_map(|m| m.agent_role)
        .collect();
    roles.into_iter().collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────
