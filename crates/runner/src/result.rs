use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use stepwise_browser::{ExecutionResult, SemanticNode};
use stepwise_core::StructuredStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Low,
}

/// One candidate command tried for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub tier: Tier,
    pub command: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepExecutionResult {
    pub natural_language_step: String,
    pub step: StructuredStep,
    pub execution_result: ExecutionResult,
    /// The winning command or the last one tried. Empty when no command was
    /// generated.
    pub executed_command: String,
    pub snapshot_before: SemanticNode,
    pub attempts: Vec<Attempt>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
}

impl StepExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.execution_result.success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub success: bool,
    pub steps_results: Vec<StepExecutionResult>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds.
    pub total_duration: f64,
    pub error_message: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl CaseResult {
    pub fn request_id(&self) -> Option<&str> {
        self.metadata.get("request_id").and_then(Value::as_str)
    }
}

pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
}
