//! Webhook ingress
//!
//! HMAC-SHA-256-verified JSON ingress that turns GitHub (and generic)
//! webhooks into [`ExternalEvent`] rows for the External evaluator and
//! mirrors them onto the event bus under the `external.*` types.

use crate::bus::{Event, EventBus, EventType};
use crate::state::store::StateStore;
use crate::state::ExternalEvent;
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;

const COMMENT_BODY_LIMIT: usize = 500;

/// Verify a `sha256=<hex>` signature header against the raw payload.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &str) -> bool {
    if signature_header.is_empty() || secret.is_empty() {
        return false;
    }
    let signature = signature_header.trim_start_matches("sha256=");

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    constant_time_eq(signature.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ─── GitHub payload subset ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GithubPayload {
    #[serde(default)]
    pub action: String,
    pub issue: Option<GithubIssue>,
    pub pull_request: Option<GithubPullRequest>,
    pub comment: Option<GithubComment>,
    pub repository: Option<GithubRepository>,
    pub release: Option<GithubRelease>,
}

#[derive(Debug, Deserialize)]
pub struct GithubIssue {
    pub number: i64,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "html_url", default)]
    pub url: String,
    pub user: Option<GithubUser>,
    #[serde(default)]
    pub labels: Vec<GithubLabel>,
}

#[derive(Debug, Deserialize)]
pub struct GithubPullRequest {
    pub number: i64,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "html_url", default)]
    pub url: String,
    pub user: Option<GithubUser>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub merged: bool,
    pub head: Option<GithubRef>,
    pub base: Option<GithubRef>,
}

#[derive(Debug, Deserialize)]
pub struct GithubComment {
    pub id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "html_url", default)]
    pub url: String,
    pub user: Option<GithubUser>,
}

#[derive(Debug, Deserialize)]
pub struct GithubRepository {
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct GithubRelease {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "html_url", default)]
    pub url: String,
    #[serde(default)]
    pub prerelease: bool,
    pub author: Option<GithubUser>,
}

#[derive(Debug, Deserialize)]
pub struct GithubUser {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct GithubLabel {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GithubRef {
    #[serde(rename = "ref")]
    pub git_ref: String,
}

/// Map a GitHub delivery to an [`ExternalEvent`].  Returns `None` for
/// deliveries the motivation system does not care about.
pub fn map_github_event(event_header: &str, payload: &GithubPayload) -> Option<ExternalEvent> {
    let mut event = ExternalEvent::new("", "github");
    if let Some(repo) = &payload.repository {
        event
            .data
            .insert("repository".into(), json!(repo.full_name));
    }
    event.data.insert("action".into(), json!(payload.action));

    match event_header {
        "issues" => {
            let issue = payload.issue.as_ref()?;
            match payload.action.as_str() {
                "opened" => {
                    event.kind = "github_issue_opened".into();
                    event.data.insert("issue_number".into(), json!(issue.number));
                    event.data.insert("issue_title".into(), json!(issue.title));
                    event.data.insert("issue_url".into(), json!(issue.url));
                    if let Some(user) = &issue.user {
                        event.data.insert("author".into(), json!(user.login));
                    }
                    let labels: Vec<&str> =
                        issue.labels.iter().map(|l| l.name.as_str()).collect();
                    event.data.insert("labels".into(), json!(labels));
                }
                "closed" | "reopened" | "edited" => {
                    event.kind = format!("github_issue_{}", payload.action);
                    event.data.insert("issue_number".into(), json!(issue.number));
                }
                _ => return None,
            }
        }

        "pull_request" => {
            let pr = payload.pull_request.as_ref()?;
            match payload.action.as_str() {
                "opened" => {
                    event.kind = "github_pr_opened".into();
                    event.data.insert("pr_number".into(), json!(pr.number));
                    event.data.insert("pr_title".into(), json!(pr.title));
                    event.data.insert("pr_url".into(), json!(pr.url));
                    event.data.insert("draft".into(), json!(pr.draft));
                    if let Some(user) = &pr.user {
                        event.data.insert("author".into(), json!(user.login));
                    }
                    if let Some(head) = &pr.head {
                        event.data.insert("head_ref".into(), json!(head.git_ref));
                    }
                    if let Some(base) = &pr.base {
                        event.data.insert("base_ref".into(), json!(base.git_ref));
                    }
                }
                "closed" => {
                    event.kind = "github_pr_closed".into();
                    event.data.insert("pr_number".into(), json!(pr.number));
                    event.data.insert("merged".into(), json!(pr.merged));
                }
                "ready_for_review" => {
                    event.kind = "github_pr_ready".into();
                    event.data.insert("pr_number".into(), json!(pr.number));
                }
                _ => return None,
            }
        }

        "issue_comment" | "pull_request_review_comment" => {
            if payload.action != "created" {
                return None;
            }
            let comment = payload.comment.as_ref()?;
            event.kind = "github_comment_added".into();
            event.data.insert("comment_id".into(), json!(comment.id));
            let body: String = comment.body.chars().take(COMMENT_BODY_LIMIT).collect();
            event.data.insert("comment_body".into(), json!(body));
            event.data.insert("comment_url".into(), json!(comment.url));
            if let Some(user) = &comment.user {
                event.data.insert("author".into(), json!(user.login));
            }
            if let Some(issue) = &payload.issue {
                event.data.insert("issue_number".into(), json!(issue.number));
            }
        }

        "release" => {
            if payload.action != "published" {
                return None;
            }
            let release = payload.release.as_ref()?;
            event.kind = "release_published".into();
            event.data.insert("release_tag".into(), json!(release.tag_name));
            event.data.insert("release_name".into(), json!(release.name));
            event.data.insert("release_url".into(), json!(release.url));
            event.data.insert("prerelease".into(), json!(release.prerelease));
            if let Some(author) = &release.author {
                event.data.insert("author".into(), json!(author.login));
            }
        }

        _ => return None,
    }

    Some(event)
}

fn bus_event_type(kind: &str) -> EventType {
    match kind {
        "github_issue_opened" => EventType::ExternalGithubIssue,
        "github_pr_opened" => EventType::ExternalGithubPr,
        "github_comment_added" => EventType::ExternalGithubComment,
        "release_published" => EventType::ExternalRelease,
        _ => EventType::ExternalWebhook,
    }
}

// ─── Ingress ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WebhookState {
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<EventBus>,
    /// When set, deliveries must carry a valid signature.
    pub secret: Option<String>,
}

/// Persist an external event and mirror it on the bus.
pub async fn ingest(state: &WebhookState, event: ExternalEvent) -> Result<()> {
    let mut bus_event = Event::new(bus_event_type(&event.kind), "webhook-ingress")
        .with_data("webhook_id", json!(event.id))
        .with_data("webhook_type", json!(event.kind));
    for (key, value) in &event.data {
        bus_event = bus_event.with_data(key.clone(), value.clone());
    }

    state.store.insert_external_event(event).await?;
    state.bus.publish(bus_event);
    Ok(())
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/github", post(github_webhook))
        .route("/webhooks/generic", post(generic_webhook))
        .with_state(state)
}

async fn github_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(&body, signature, secret) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid webhook signature"})),
            );
        }
    }

    let Some(event_header) = headers.get("x-github-event").and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing X-GitHub-Event header"})),
        );
    };

    let payload: GithubPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid JSON payload"})),
            );
        }
    };

    let Some(event) = map_github_event(event_header, &payload) else {
        return (StatusCode::OK, Json(json!({"status": "ignored"})));
    };

    let event_id = event.id.clone();
    let kind = event.kind.clone();
    if let Err(e) = ingest(&state, event).await {
        tracing::error!(error = %e, "failed to store webhook event");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "failed to store event"})),
        );
    }

    tracing::info!(event_id = %event_id, kind = %kind, "webhook ingested");
    (
        StatusCode::OK,
        Json(json!({"status": "received", "id": event_id, "type": kind})),
    )
}

async fn generic_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.secret {
        let signature = headers
            .get("x-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(&body, signature, secret) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid webhook signature"})),
            );
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid JSON payload"})),
            );
        }
    };

    let kind = headers
        .get("x-webhook-type")
        .and_then(|v| v.to_str().ok())
        .or_else(|| payload.get("type").and_then(|v| v.as_str()))
        .unwrap_or("webhook")
        .to_string();

    let mut event = ExternalEvent::new(kind, "webhook");
    if let Some(object) = payload.as_object() {
        for (key, value) in object {
            event.data.insert(key.clone(), value.clone());
        }
    }

    let event_id = event.id.clone();
    if let Err(e) = ingest(&state, event).await {
        tracing::error!(error = %e, "failed to store webhook event");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "failed to store event"})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({"status": "received", "id": event_id})),
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────
