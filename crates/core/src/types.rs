use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a prompt. The generators only ever send plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn text(&self) -> &str {
        &self.content
    }
}

/// Completion text plus what the runner logs about the call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub finish_reason: String,
    pub usage: serde_json::Value,
}
