use async_trait::async_trait;

use crate::errors::DeskPilotResult;
use crate::llm::types::{CallConfig, ChatMessage, LlmResponse};

/// Unified LLM provider trait. New providers implement this and register in config.toml.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Matches the provider's config.toml key.
    fn name(&self) -> &str;

    /// One non-streaming chat completion.
    async fn chat(&self, messages: Vec<ChatMessage>, cfg: &CallConfig) -> DeskPilotResult<LlmResponse>;
}
