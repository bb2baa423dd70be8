use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Intent class of a structured step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Navigate,
    Click,
    Input,
    Verify,
    Wait,
    #[serde(other)]
    Custom,
}

impl StepAction {
    /// Input-class actions. `custom` is included because the translator maps
    /// unrecognised input verbs there.
    pub fn takes_value(&self) -> bool {
        matches!(self, StepAction::Input | StepAction::Custom)
    }

    /// Unknown action words fall back to `Custom`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "navigate" => StepAction::Navigate,
            "click" => StepAction::Click,
            "input" => StepAction::Input,
            "verify" => StepAction::Verify,
            "wait" => StepAction::Wait,
            _ => StepAction::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Navigate => "navigate",
            StepAction::Click => "click",
            StepAction::Input => "input",
            StepAction::Verify => "verify",
            StepAction::Wait => "wait",
            StepAction::Custom => "custom",
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One translated test instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredStep {
    gherkin: String,
    action: StepAction,
    target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl StructuredStep {
    /// `value` is dropped for actions that do not take one.
    pub fn new(
        gherkin: impl Into<String>,
        action: StepAction,
        target: impl Into<String>,
        value: Option<String>,
    ) -> Result<Self> {
        let gherkin = gherkin.into();
        let target = target.into();
        if gherkin.trim().is_empty() {
            return Err(Error::Validation("step gherkin must not be empty".to_string()));
        }
        if target.trim().is_empty() {
            return Err(Error::Validation("step target must not be empty".to_string()));
        }
        let value = value.filter(|_| action.takes_value());
        Ok(Self { gherkin, action, target, value })
    }

    /// Builds a step from raw translator fields. An empty action word is rejected.
    pub fn from_parts(gherkin: &str, action: &str, target: &str, value: Option<String>) -> Result<Self> {
        if action.trim().is_empty() {
            return Err(Error::Validation("step action must not be empty".to_string()));
        }
        Self::new(gherkin, StepAction::parse(action), target, value)
    }

    pub fn gherkin(&self) -> &str {
        &self.gherkin
    }

    pub fn action(&self) -> StepAction {
        self.action
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(default)]
    gherkin: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

impl<'de> Deserialize<'de> for StructuredStep {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawStep::deserialize(deserializer)?;
        let value = match raw.value {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        StructuredStep::from_parts(&raw.gherkin, &raw.action, &raw.target, value)
            .map_err(serde::de::Error::custom)
    }
}
