//! Model client for LLM inference using an OpenAI-compatible API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::retry::{RetryPolicy, Retryable, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("API error ({status}): {body}")]
    ApiError { status: u16, body: String },
    #[error("Model returned an empty completion")]
    EmptyCompletion,
}

impl Retryable for ModelError {
    fn is_retryable(&self) -> bool {
        match self {
            // Network errors and timeouts
            ModelError::RequestFailed(_) => true,
            // Server errors (5xx) and rate limits (429)
            ModelError::ApiError { status, .. } => *status == 429 || *status >= 500,
            ModelError::ParseError(_) => false,
            ModelError::EmptyCompletion => true,
        }
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// LLM capability used by the orchestrator and the fallback advisor.
///
/// Implementations are treated as unreliable: callers tolerate errors and
/// malformed output.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a conversation and return the assistant text.
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ModelError>;
}

/// Configuration for the AI model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            max_tokens: 2048,
            temperature: 0.2,
            request_timeout_secs: 60,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl ModelConfig {
    /// Create a new ModelConfig with custom base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a new ModelConfig with custom API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Create a new ModelConfig with custom model name.
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_retry_delay(Duration::from_secs(self.retry_delay_secs))
    }
}

/// OpenAI API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Client for interacting with OpenAI-compatible chat models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
    retry: RetryPolicy,
}

impl ModelClient {
    /// Create a new ModelClient with the given configuration.
    pub fn new(config: ModelConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        let retry = config.retry_policy();

        Self {
            config,
            client,
            retry,
        }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Send a single request to the API.
    async fn send_request(&self, url: &str, body: &Value) -> Result<String, ModelError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::ParseError(e.to_string()))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ModelError::ParseError("No choices in response".to_string()))?;

        let content = strip_thinking(&content);
        if content.is_empty() {
            return Err(ModelError::EmptyCompletion);
        }
        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for ModelClient {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = MessageBuilder::build_request(&self.config, system_prompt, messages);

        tracing::debug!(
            model = %self.config.model_name,
            messages = messages.len(),
            "sending completion request"
        );

        self.retry
            .run("model.complete", || self.send_request(&url, &body))
            .await
    }
}

/// Drop a leading `<think>...</think>` block some reasoning models emit.
fn strip_thinking(content: &str) -> String {
    match content.split_once("</think>") {
        Some((_, rest)) => rest.trim().to_string(),
        None => content.replace("<think>", "").trim().to_string(),
    }
}

/// Helper for building chat completion payloads.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Create a system message.
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// Convert a chat message to the wire format.
    pub fn to_wire(message: &ChatMessage) -> Value {
        json!({
            "role": message.role,
            "content": message.content
        })
    }

    /// Build the full request body.
    pub fn build_request(config: &ModelConfig, system_prompt: &str, messages: &[ChatMessage]) -> Value {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(Self::create_system_message(system_prompt));
        wire.extend(messages.iter().map(Self::to_wire));

        json!({
            "messages": wire,
            "model": config.model_name,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
        })
    }
}
