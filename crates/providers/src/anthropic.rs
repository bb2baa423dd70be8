use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use stepwise_core::types::{ChatMessage, LLMResponse, Role};
use stepwise_core::Result;

use crate::client::Endpoint;
use crate::{Provider, Sampling};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages API. System turns are lifted into the top-level `system` field.
pub struct AnthropicProvider {
    endpoint: Endpoint,
    sampling: Sampling,
}

impl AnthropicProvider {
    pub fn new(endpoint: Endpoint, sampling: Sampling) -> Self {
        Self { endpoint, sampling }
    }

    fn model(&self) -> &str {
        self.endpoint.model.strip_prefix("anthropic/").unwrap_or(&self.endpoint.model)
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text())
            .collect();
        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| json!({ "role": m.role, "content": m.text() }))
            .collect();

        let mut body = json!({
            "model": self.model(),
            "max_tokens": self.sampling.max_tokens,
            "temperature": self.sampling.temperature,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system.join("\n\n"));
        }
        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<LLMResponse> {
        let headers = [
            ("x-api-key", self.endpoint.api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];
        let raw = self
            .endpoint
            .post_json("messages", &headers, &self.request_body(messages))
            .await?;
        Ok(self.endpoint.parse::<MessageReply>(&raw)?.into_response())
    }
}

#[derive(Debug, Deserialize)]
struct MessageReply {
    content: Vec<Block>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Value,
}

#[derive(Debug, Deserialize)]
struct Block {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl MessageReply {
    fn into_response(self) -> LLMResponse {
        let text: String = self
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        LLMResponse {
            content: Some(text).filter(|t| !t.is_empty()),
            finish_reason: self.stop_reason.unwrap_or_else(|| "stop".to_string()),
            usage: self.usage,
        }
    }
}
