//! Model client module for LLM inference.

mod client;
mod retry;

pub use client::{ChatMessage, ChatRole, LanguageModel, MessageBuilder, ModelClient, ModelConfig, ModelError};
pub use retry::{RetryPolicy, Retryable, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};
