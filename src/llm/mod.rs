use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{LlmProvider, ModelConfig};

pub mod error;
pub mod openai_generic;

pub use error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
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
}

/// Token usage information from a completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// A single completion call as issued by the router
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// What a provider hands back for a completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// A backend capable of producing chat completions.
///
/// Implementations report failures through [`ProviderError`] so the router
/// can tell availability problems apart from bad responses.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider label used in logs and call records
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}

/// Build the provider for a configured model.
pub fn create_provider(
    model: &ModelConfig,
    request_timeout: std::time::Duration,
) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    let api_key = model.resolve_api_key();

    let base_url = match (&model.provider, &model.base_url) {
        (_, Some(url)) => url.clone(),
        (LlmProvider::OpenAI, None) => "https://api.openai.com/v1".to_string(),
        (LlmProvider::OpenRouter, None) => "https://openrouter.ai/api/v1".to_string(),
        (LlmProvider::Ollama, None) => "http://localhost:11434/v1".to_string(),
        (LlmProvider::OpenAIGeneric, None) => anyhow::bail!(
            "Model '{}' uses the openai-generic provider but has no base_url",
            model.name
        ),
    };

    if api_key.is_none() && matches!(model.provider, LlmProvider::OpenAI | LlmProvider::OpenRouter)
    {
        tracing::warn!(
            "No API key found for model '{}' ({}); calls will likely be rejected",
            model.name,
            model.provider.as_str()
        );
    }

    Ok(Arc::new(openai_generic::GenericOpenAiClient::new(
        model.provider.as_str(),
        base_url,
        api_key,
        request_timeout,
    )))
}
