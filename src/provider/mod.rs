//! Chat-completion provider abstraction
//!
//! Workers talk to language-model providers through [`ChatProvider`].  Only
//! the chat-completion contract is modeled here; provider-specific wire
//! formats stay inside the implementations.

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatCompletionResponse {
    /// Content of the first choice, if any.
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// Error surface of the chat-completion contract.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited")]
    RateLimited,
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("context length exceeded")]
    ContextLengthExceeded,
    #[error("provider error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl ProviderError {
    /// Whether the dispatcher should retry the bead on a later pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::RateLimited
        ) || matches!(self, ProviderError::Api { status, .. } if *status >= 500)
    }
}

/// Provider trait all chat backends implement.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError>;
}

// ─── Registry ────────────────────────────────────────────────────────────

/// Keyed set of configured providers, shared by the worker pool.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

// ─── Token limits ────────────────────────────────────────────────────────

/// Context-window size for known model families.  Unknown models default to
/// 100k.
pub fn model_token_limit(model: &str) -> usize {
    const LIMITS: &[(&str, usize)] = &[
        ("gpt-4", 8_192),
        ("gpt-4-32k", 32_768),
        ("gpt-4-turbo", 128_000),
        ("gpt-4o", 128_000),
        ("gpt-3.5-turbo", 4_096),
        ("gpt-3.5-turbo-16k", 16_384),
        ("claude-3-opus", 200_000),
        ("claude-3-sonnet", 200_000),
        ("claude-3-haiku", 200_000),
    ];

    if let Some((_, limit)) = LIMITS.iter().find(|(name, _)| *name == model) {
        return *limit;
    }
    // Dated model ids (claude-3-opus-20240229 style) resolve to the longest
    // matching family prefix.
    LIMITS
        .iter()
        .filter(|(name, _)| model.starts_with(name))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, limit)| *limit)
        .unwrap_or(100_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_limit_lookup() {
        assert_eq!(model_token_limit("gpt-4"), 8_192);
        assert_eq!(model_token_limit("gpt-4-turbo"), 128_000);
        assert_eq!(model_token_limit("claude-3-opus-20240229"), 200_000);
        assert_eq!(model_token_limit("some-unknown-model"), 100_000);
    }

    #[test]
    fn retryable_errors() {
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(ProviderError::Api {
            status: 503,
            message: "overloaded".into()
        }
        .is_retryable());
        assert!(!ProviderError::ModelNotFound("nope".into()).is_retryable());
        assert!(!ProviderError::ContextLengthExceeded.is_retryable());
    }

    #[test]
    fn registry_lists_sorted() {
        struct Null;
        #[async_trait]
        impl ChatProvider for Null {
            fn name(&self) -> &str {
                "null"
            }
            async fn create_chat_completion(
                &self,
                _request: ChatCompletionRequest,
            ) -> Result<ChatCompletionResponse, ProviderError> {
                Err(ProviderError::ModelNotFound("null".into()))
            }
        }

        let mut registry = ProviderRegistry::new();
        registry.register("zeta", Arc::new(Null));
        registry.register("alpha", Arc::new(Null));
        assert_eq!(registry.list(), vec!["alpha", "zeta"]);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("missing").is_none());
    }
}
