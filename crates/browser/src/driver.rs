use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use stepwise_core::config::BrowserConfig;
use stepwise_core::Result;

use crate::locator::{ElementAction, Locator};

/// Page lifecycle milestones a navigation or explicit wait can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Load,
    DomContentLoaded,
    NetworkIdle,
}

impl LoadState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "load" => Some(Self::Load),
            "domcontentloaded" => Some(Self::DomContentLoaded),
            "networkidle" => Some(Self::NetworkIdle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::DomContentLoaded => "domcontentloaded",
            Self::NetworkIdle => "networkidle",
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live page in an isolated browser context.
///
/// Implementations own the underlying process; `close` must release it.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str, wait_until: LoadState, timeout: Duration) -> Result<()>;

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<()>;

    async fn url(&self) -> Result<String>;

    /// Serialized DOM of the current document.
    async fn content(&self) -> Result<String>;

    /// PNG bytes.
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>>;

    /// Resolves `locator` within `timeout` and performs `action` on the single
    /// match. Read actions return their value; the rest return `Value::Null`.
    async fn element(&self, locator: &Locator, action: &ElementAction, timeout: Duration) -> Result<Value>;

    async fn keyboard_press(&self, key: &str) -> Result<()>;

    async fn keyboard_type(&self, text: &str) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn PageDriver>>;
}
