pub mod anthropic;
pub mod client;
pub mod factory;
pub mod openai;

use async_trait::async_trait;
use stepwise_core::config::LlmConfig;
use stepwise_core::types::{ChatMessage, LLMResponse};
use stepwise_core::Result;

/// A chat-completion backend used by the step translator and the
/// instruction generator.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<LLMResponse>;
}

/// Sampling settings shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&LlmConfig> for Sampling {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

pub use anthropic::AnthropicProvider;
pub use client::Endpoint;
pub use factory::{create_llm_provider, create_provider, infer_provider_from_model};
pub use openai::OpenAIProvider;
