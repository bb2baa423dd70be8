use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use stepwise_core::types::{ChatMessage, LLMResponse};
use stepwise_core::{Error, Result};

use crate::client::Endpoint;
use crate::{Provider, Sampling};

/// Any `/chat/completions` compatible endpoint (OpenAI, OpenRouter, vLLM...).
pub struct OpenAIProvider {
    endpoint: Endpoint,
    sampling: Sampling,
}

impl OpenAIProvider {
    pub fn new(endpoint: Endpoint, sampling: Sampling) -> Self {
        Self { endpoint, sampling }
    }

    /// OpenAI itself rejects the "openai/" routing prefix; OpenRouter vendor
    /// prefixes are left alone.
    fn model(&self) -> &str {
        self.endpoint.model.strip_prefix("openai/").unwrap_or(&self.endpoint.model)
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        json!({
            "model": self.model(),
            "messages": messages,
            "max_tokens": self.sampling.max_tokens,
            "temperature": self.sampling.temperature,
        })
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<LLMResponse> {
        let auth = format!("Bearer {}", self.endpoint.api_key);
        let raw = self
            .endpoint
            .post_json("chat/completions", &[("Authorization", auth.as_str())], &self.request_body(messages))
            .await?;
        self.endpoint.parse::<Completion>(&raw)?.into_response()
    }
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Value,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl Completion {
    fn into_response(self) -> Result<LLMResponse> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;
        Ok(LLMResponse {
            content: choice.message.content.filter(|c| !c.is_empty()),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: self.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(model: &str) -> OpenAIProvider {
        let endpoint = Endpoint::new("openai", "sk-test", "https://api.openai.com/v1", model, reqwest::Client::new());
        OpenAIProvider::new(endpoint, Sampling { max_tokens: 1024, temperature: 0.0 })
    }

    #[test]
    fn test_request_body() {
        let body = provider("openai/gpt-4o").request_body(&[ChatMessage::system("sys"), ChatMessage::user("hi")]);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["max_tokens"], 1024);
    }

    #[test]
    fn test_vendor_prefix_kept() {
        assert_eq!(provider("mistralai/mistral-large").model(), "mistralai/mistral-large");
    }

    #[test]
    fn test_completion_into_response() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"{\"high_precision\":[]}"},"finish_reason":"stop"}],"usage":{"total_tokens":12}}"#;
        let out = serde_json::from_str::<Completion>(raw).unwrap().into_response().unwrap();
        assert_eq!(out.content.as_deref(), Some("{\"high_precision\":[]}"));
        assert_eq!(out.finish_reason, "stop");
        assert_eq!(out.usage["total_tokens"], 12);
    }

    #[test]
    fn test_empty_content_and_choices() {
        let raw = r#"{"choices":[{"message":{"content":""},"finish_reason":null}]}"#;
        let out = serde_json::from_str::<Completion>(raw).unwrap().into_response().unwrap();
        assert!(out.content.is_none());
        assert!(out.usage.is_null());

        let empty: Completion = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(empty.into_response().is_err());
    }
}
