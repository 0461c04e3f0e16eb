//! OpenAI-compatible chat provider (direct API)
//!
//! Works against api.openai.com and any endpoint speaking the same
//! `/chat/completions` dialect.

use super::{ChatCompletionRequest, ChatCompletionResponse, ChatProvider, ProviderError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    provider_name: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("provider_name", &self.provider_name)
            .field("base_url", &self.base_url)
            .field("api_key", &"<REDACTED>")
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.openai.com/v1".to_string(), "openai")
    }

    /// Create against a custom base URL (for OpenAI-compatible providers).
    pub fn with_base_url(api_key: String, base_url: String, provider_name: &str) -> Self {
        tracing::debug!(
            provider = provider_name,
            base_url = %base_url,
            api_key_len = api_key.len(),
            "Creating OpenAI-compatible provider"
        );
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            provider_name: provider_name.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

fn map_api_error(status: StatusCode, body: &str, model: &str) -> ProviderError {
    let detail: Option<ApiErrorDetail> = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.chars().take(200).collect());
    let code = detail.and_then(|d| d.code).unwrap_or_default();

    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::NOT_FOUND => ProviderError::ModelNotFound(model.to_string()),
        _ if code == "context_length_exceeded" || message.contains("maximum context length") => {
            ProviderError::ContextLengthExceeded
        }
        _ if code == "model_not_found" => ProviderError::ModelNotFound(model.to_string()),
        _ => ProviderError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn create_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let model = request.model.clone();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_api_error(status, &body, &model));
        }

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| ProviderError::Transport(format!("invalid response body: {e}")))
    }
}
