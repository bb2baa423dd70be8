//! Step translation and instruction generation.
//!
//! Both collaborators sit behind traits so the orchestrators can be driven by
//! any implementation. The LLM-backed ones share a provider and one retry
//! loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::config::LlmConfig;
use stepwise_core::types::ChatMessage;
use stepwise_core::{Error, Result, StructuredStep};
use stepwise_providers::Provider;
use tracing::{debug, info, warn};

use crate::prompts;
use crate::retry::RetryPolicy;

/// Candidate commands for one step, each list in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInstructionSet {
    pub high_precision: Vec<String>,
    pub low_precision: Vec<String>,
}

impl CandidateInstructionSet {
    pub fn is_empty(&self) -> bool {
        self.high_precision.is_empty() && self.low_precision.is_empty()
    }

    pub fn len(&self) -> usize {
        self.high_precision.len() + self.low_precision.len()
    }
}

#[async_trait]
pub trait InstructionGenerator: Send + Sync {
    /// Failures are `Error::Generation`.
    async fn generate(&self, snapshot_json: &str, step_text: &str) -> Result<CandidateInstructionSet>;
}

#[async_trait]
pub trait StepTranslator: Send + Sync {
    /// Failures are `Error::Generation`. An empty list is returned as-is.
    async fn translate(&self, natural_language_steps: &str) -> Result<Vec<StructuredStep>>;
}

/// Removes a surrounding Markdown code fence, with or without a language tag.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn string_list(data: &Value, key: &str) -> Result<Vec<String>> {
    let list = data
        .get(key)
        .ok_or_else(|| Error::Generation(format!("Missing required field in AI response: '{}'", key)))?
        .as_array()
        .ok_or_else(|| Error::Generation(format!("'{}' must be a list", key)))?;
    list.iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Generation(format!("'{}' must contain only strings", key)))
        })
        .collect()
}

pub fn parse_candidate_set(raw: &str) -> Result<CandidateInstructionSet> {
    let data: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| Error::Generation(format!("Failed to parse AI response as JSON: {}", e)))?;
    if !data.is_object() {
        return Err(Error::Generation("Expected a JSON object with instruction lists".to_string()));
    }
    Ok(CandidateInstructionSet {
        high_precision: string_list(&data, "high_precision")?,
        low_precision: string_list(&data, "low_precision")?,
    })
}

/// Parses the translator's JSON array into validated steps.
pub fn parse_structured_steps(raw: &str) -> Result<Vec<StructuredStep>> {
    let data: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| Error::Generation(format!("Failed to parse AI response as JSON: {}", e)))?;
    let items = data
        .as_array()
        .ok_or_else(|| Error::Generation("Expected a JSON array of steps".to_string()))?;

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            for field in ["gherkin", "action", "target"] {
                if item.get(field).is_none() {
                    return Err(Error::Generation(format!(
                        "Missing required field in AI response: '{}' (step {})",
                        field,
                        idx + 1
                    )));
                }
            }
            serde_json::from_value::<StructuredStep>(item.clone())
                .map_err(|e| Error::Generation(format!("Invalid step {}: {}", idx + 1, e)))
        })
        .collect()
}

/// One prompt, retried on provider errors. An empty reply is not retried.
async fn complete(provider: &dyn Provider, policy: &RetryPolicy, system: &str, prompt: &str) -> Result<String> {
    let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
    let mut last_error = None;

    for attempt in policy.attempts() {
        match provider.chat(&messages).await {
            Ok(response) => {
                if attempt > 1 {
                    info!(attempt, "LLM call succeeded after retry");
                }
                let content = response.content.unwrap_or_default();
                if content.trim().is_empty() {
                    return Err(Error::Generation("Empty response from AI service".to_string()));
                }
                debug!(content_len = content.len(), finish_reason = %response.finish_reason, "LLM response received");
                return Ok(content);
            }
            Err(e) => {
                warn!(error = %e, attempt, max_attempts = policy.max_attempts, "LLM call failed");
                last_error = Some(e);
                if let Some(delay) = policy.delay_for(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(Error::Generation(match last_error {
        Some(e) => format!("AI service unavailable after {} attempts: {}", policy.max_attempts, e),
        None => "AI service unavailable".to_string(),
    }))
}

fn llm_retry_policy(config: &LlmConfig) -> RetryPolicy {
    RetryPolicy::exponential(
        config.llm_max_retries + 1,
        Duration::from_millis(config.llm_retry_delay_ms),
    )
}

pub struct LlmInstructionGenerator {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
}

impl LlmInstructionGenerator {
    pub fn new(provider: Arc<dyn Provider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            retry: llm_retry_policy(config),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl InstructionGenerator for LlmInstructionGenerator {
    async fn generate(&self, snapshot_json: &str, step_text: &str) -> Result<CandidateInstructionSet> {
        let prompt = prompts::generator_prompt(snapshot_json, step_text);
        let raw = complete(self.provider.as_ref(), &self.retry, prompts::GENERATOR_SYSTEM, &prompt).await?;
        let set = parse_candidate_set(&raw)?;
        debug!(
            high = set.high_precision.len(),
            low = set.low_precision.len(),
            "Candidate instructions generated"
        );
        Ok(set)
    }
}

pub struct LlmStepTranslator {
    provider: Arc<dyn Provider>,
    retry: RetryPolicy,
}

impl LlmStepTranslator {
    pub fn new(provider: Arc<dyn Provider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            retry: llm_retry_policy(config),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl StepTranslator for LlmStepTranslator {
    async fn translate(&self, natural_language_steps: &str) -> Result<Vec<StructuredStep>> {
        let prompt = prompts::translator_prompt(natural_language_steps);
        let raw = complete(self.provider.as_ref(), &self.retry, prompts::TRANSLATOR_SYSTEM, &prompt).await?;
        let steps = parse_structured_steps(&raw)?;
        info!(step_count = steps.len(), "Structured steps generated");
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use stepwise_core::types::LLMResponse;
    use stepwise_core::StepAction;

    struct ScriptedProvider {
        replies: Mutex<Vec<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(&self, messages: &[ChatMessage]) -> Result<LLMResponse> {
            self.prompts.lock().unwrap().push(messages.last().map(|m| m.text().to_string()).unwrap_or_default());
            let next = self.replies.lock().unwrap().remove(0);
            next.map(|content| LLMResponse {
                content: Some(content),
                finish_reason: "stop".to_string(),
                usage: Value::Null,
            })
        }
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::ZERO)
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\n[1]\n```\n"), "[1]");
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn test_parse_candidate_set() {
        let raw = "```json\n{\"high_precision\": [\"page.click('#a')\"], \"low_precision\": []}\n```";
        let set = parse_candidate_set(raw).unwrap();
        assert_eq!(set.high_precision, vec!["page.click('#a')"]);
        assert!(set.low_precision.is_empty());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_parse_candidate_set_errors() {
        let missing = parse_candidate_set(r#"{"high_precision": []}"#).unwrap_err();
        assert!(matches!(missing, Error::Generation(_)));
        assert!(missing.to_string().contains("low_precision"));

        assert!(matches!(parse_candidate_set("not json"), Err(Error::Generation(_))));
        assert!(matches!(
            parse_candidate_set(r#"{"high_precision": [1], "low_precision": []}"#),
            Err(Error::Generation(_))
        ));
        assert!(matches!(parse_candidate_set("[]"), Err(Error::Generation(_))));
    }

    #[test]
    fn test_parse_structured_steps() {
        let raw = r#"[
            {"gherkin": "When I enter \"a@b.c\" into email", "action": "input", "target": "email", "value": "a@b.c"},
            {"gherkin": "And I click submit", "action": "click", "target": "submit"}
        ]"#;
        let steps = parse_structured_steps(raw).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action(), StepAction::Input);
        assert_eq!(steps[0].value(), Some("a@b.c"));
        assert_eq!(steps[1].target(), "submit");
    }

    #[test]
    fn test_parse_structured_steps_requires_fields() {
        let err = parse_structured_steps(r#"[{"gherkin": "Then done", "action": "verify"}]"#).unwrap_err();
        assert!(err.to_string().contains("target"));
        assert!(matches!(parse_structured_steps(r#"{"steps": []}"#), Err(Error::Generation(_))));
        assert!(parse_structured_steps("[]").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generator_retries_provider_errors() {
        let provider = ScriptedProvider::new(vec![
            Err(Error::Provider("503".to_string())),
            Ok(r#"{"high_precision": ["page.click('#go')"], "low_precision": ["page.click('text=Go')"]}"#.to_string()),
        ]);
        let generator = LlmInstructionGenerator::new(provider.clone(), &LlmConfig::default()).with_retry(no_wait());
        let set = generator.generate("{\"role\": \"WebArea\"}", "When I click Go").await.unwrap();
        assert_eq!(set.high_precision.len(), 1);
        assert_eq!(provider.calls(), 2);
        let prompt = provider.prompts.lock().unwrap()[1].clone();
        assert!(prompt.contains("When I click Go"));
        assert!(prompt.contains("WebArea"));
    }

    #[tokio::test]
    async fn test_generator_gives_up_after_policy() {
        let provider = ScriptedProvider::new(vec![
            Err(Error::Provider("a".to_string())),
            Err(Error::Provider("b".to_string())),
            Err(Error::Provider("c".to_string())),
        ]);
        let generator = LlmInstructionGenerator::new(provider.clone(), &LlmConfig::default()).with_retry(no_wait());
        let err = generator.generate("{}", "step").await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_translator_does_not_retry_bad_json() {
        let provider = ScriptedProvider::new(vec![Ok("Sure! Here are the steps".to_string())]);
        let translator = LlmStepTranslator::new(provider.clone(), &LlmConfig::default()).with_retry(no_wait());
        let err = translator.translate("Click submit").await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert_eq!(provider.calls(), 1);
    }
}
