//! Per-bead conversation contexts and the provider token budget
//!
//! A conversation belongs to one bead and one agent at a time (the
//! at-most-one-assignee invariant keeps cross-worker interleaving out).
//! Message lists are append-only; once any message exists the head is always
//! the persona system prompt.  Assembly enforces the 0.8× model budget with
//! a system-preserving sliding window.

use crate::provider::{model_token_limit, ChatMessage, Role};
use crate::state::Persona;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// Fixed appendix telling agents how to answer so the action router can
/// parse the response.
pub const ACTION_PROMPT: &str = "\
Every response must contain exactly one ACTION line of the form \
`ACTION: COMMAND arguments`.

Available commands:
  ACTION: COMMENT <text>        - record an observation on the current bead
  ACTION: CREATE_BEAD <title>   - file a follow-up unit of work
  ACTION: BLOCK <bead-id>       - declare a dependency on another bead
  ACTION: DECIDE <choice>       - resolve a pending decision
  ACTION: DONE <summary>        - signal the current bead is complete

State your reasoning in plain text first, then end with the ACTION line.";

/// Rough token estimate: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Provider budget for a model: 80% of its context window.
pub fn token_budget(model: &str) -> usize {
    model_token_limit(model) * 8 / 10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub token_estimate: usize,
    pub timestamp: DateTime<Utc>,
}

/// Per-bead chat history with a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub bead_id: String,
    pub project_id: String,
    pub messages: Vec<ConversationMessage>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(bead_id: impl Into<String>, project_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            bead_id: bead_id.into(),
            project_id: project_id.into(),
            messages: Vec::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Append a message.  The list is append-only; the first message ever
    /// added must be the system prompt.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        let content = content.into();
        debug_assert!(
            !self.messages.is_empty() || role == Role::System,
            "conversation head must be a system message"
        );
        self.messages.push(ConversationMessage {
            token_estimate: estimate_tokens(&content),
            role,
            content,
            timestamp: Utc::now(),
        });
    }

    /// Whether a message with this exact content is already recorded.
    pub fn contains_content(&self, content: &str) -> bool {
        self.messages.iter().any(|m| m.content == content)
    }

    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }
}

// ─── Prompt assembly ─────────────────────────────────────────────────────

/// Render a persona document into the conversation's system prompt.
pub fn build_system_prompt(agent_name: &str, persona: &Persona) -> String {
    let mut prompt = String::new();

    if persona.character.is_empty() && persona.mission.is_empty() {
        prompt.push_str(&format!("You are {agent_name}, an AI agent.\n\n"));
    }
    if !persona.character.is_empty() {
        prompt.push_str(&format!("# Your Character\n{}\n\n", persona.character));
    }
    if !persona.mission.is_empty() {
        prompt.push_str(&format!("# Your Mission\n{}\n\n", persona.mission));
    }
    if !persona.personality.is_empty() {
        prompt.push_str(&format!("# Your Personality\n{}\n\n", persona.personality));
    }
    if !persona.capabilities.is_empty() {
        prompt.push_str("# Your Capabilities\n");
        for capability in &persona.capabilities {
            prompt.push_str(&format!("- {capability}\n"));
        }
        prompt.push('\n');
    }
    if !persona.autonomy_instructions.is_empty() {
        prompt.push_str(&format!(
            "# Autonomy Guidelines\n{}\n\n",
            persona.autonomy_instructions
        ));
    }
    if !persona.decision_instructions.is_empty() {
        prompt.push_str(&format!(
            "# Decision Making\n{}\n\n",
            persona.decision_instructions
        ));
    }

    prompt.push_str(&format!("# Required Output Format\n{ACTION_PROMPT}\n"));
    prompt
}

/// Build the user message for a task: description plus optional context
/// block.
pub fn build_user_prompt(description: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => format!("{description}\n\nContext:\n{ctx}"),
        _ => description.to_string(),
    }
}

// ─── Token budget enforcement ────────────────────────────────────────────

/// Truncate a message list to fit within `max_tokens`.
///
/// Sliding window: message 0 (the system prompt) is always kept; messages
/// are retained from the end toward the front while they fit; when anything
/// was dropped a synthesized system notice is inserted after the head.
pub fn enforce_token_budget(messages: Vec<ChatMessage>, max_tokens: usize) -> Vec<ChatMessage> {
    let total: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
    if total <= max_tokens || messages.is_empty() {
        return messages;
    }

    let system_tokens = estimate_tokens(&messages[0].content);
    let mut recent_tokens = 0usize;
    let mut cut = messages.len();

    for i in (1..messages.len()).rev() {
        let msg_tokens = estimate_tokens(&messages[i].content);
        if system_tokens + recent_tokens + msg_tokens > max_tokens {
            break;
        }
        recent_tokens += msg_tokens;
        cut = i;
    }

    if cut <= 1 {
        return messages;
    }

    let dropped = cut - 1;
    let notice = ChatMessage::system(format!(
        "[Note: {dropped} older messages truncated to stay within token limit]"
    ));

    let mut result = Vec::with_capacity(messages.len() - dropped + 2);
    result.push(messages[0].clone());
    result.push(notice);
    result.extend(messages.into_iter().skip(cut));
    result
}

/// Assemble the provider message list for a task turn.
///
/// Seeds the system prompt on an empty history, appends the user message,
/// and applies the model's token budget.  The new user prompt is also
/// recorded on the context (append-only).
pub fn assemble_task_messages(
    context: &mut ConversationContext,
    agent_name: &str,
    persona: &Persona,
    model: &str,
    description: &str,
    task_context: Option<&str>,
) -> Vec<ChatMessage> {
    if context.messages.is_empty() {
        let system = build_system_prompt(agent_name, persona);
        context.add_message(Role::System, system);
    }

    let user_prompt = build_user_prompt(description, task_context);
    context.add_message(Role::User, user_prompt);

    enforce_token_budget(context.to_chat_messages(), token_budget(model))
}

// ─── Tests ───────────────────────────────────────────────────────────────
