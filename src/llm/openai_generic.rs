//! Generic OpenAI-compatible chat completions client
//!
//! Works against any server that implements the `/chat/completions` route:
//! OpenAI itself, OpenRouter, Ollama in compatibility mode, vLLM, LiteLLM,
//! LM Studio and friends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, Completion, CompletionProvider, CompletionRequest, ProviderError, TokenUsage};

/// A client for any OpenAI-compatible API endpoint
pub struct GenericOpenAiClient {
    /// Label reported through `CompletionProvider::name`
    label: String,
    /// Optional API key (some self-hosted servers don't require auth)
    api_key: Option<String>,
    /// Base URL for the API (e.g., "http://localhost:8000/v1")
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

impl GenericOpenAiClient {
    pub fn new(
        label: impl Into<String>,
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        // Normalize base URL - remove trailing slash if present
        let base_url = base_url.trim_end_matches('/').to_string();

        Self {
            label: label.into(),
            api_key,
            base_url,
            timeout,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl CompletionProvider for GenericOpenAiClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = OpenAiRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");

        // Add authorization header only if API key is provided
        if let Some(ref api_key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else {
                ProviderError::Transport(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: error_text,
            });
        }

        // The body arrived; anything wrong from here on is the response's fault
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else {
                ProviderError::Transport(e.to_string())
            }
        })?;

        let parsed: OpenAiResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(format!("invalid completion body: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("response contained no message".into()))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

        Ok(Completion { content, usage })
    }
}
