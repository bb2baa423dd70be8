//! Command execution sandbox.
//!
//! Owns one browser session and runs generated commands against it. Every
//! command goes through the allow-list and the command parser; nothing is
//! evaluated. Every attempt on a live session ends with a screenshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepwise_core::config::BrowserConfig;
use stepwise_core::{Error, ErrorKind, Result};
use tracing::{debug, info, warn};

use crate::allowlist;
use crate::chrome::ChromeLauncher;
use crate::command::{self, Assertion, Command};
use crate::driver::{BrowserLauncher, LoadState, PageDriver};
use crate::locator::{ElementAction, Locator};

const ASSERT_POLL: Duration = Duration::from_millis(100);

static SCREENSHOT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub screenshot_path: Option<String>,
    pub error_message: Option<String>,
    pub page_url: Option<String>,
    /// Seconds.
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ExecutionResult {
    pub fn failure(err: &Error, execution_time: f64) -> Self {
        Self {
            success: false,
            screenshot_path: None,
            error_message: Some(err.to_string()),
            page_url: None,
            execution_time,
            result: None,
            error_kind: Some(err.kind()),
        }
    }
}

/// What the orchestrators need from a browser session.
#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    /// Idempotent.
    async fn start(&mut self) -> Result<()>;

    /// Idempotent; never fails.
    async fn stop(&mut self);

    fn is_live(&self) -> bool;

    async fn page_content(&self) -> Result<String>;

    async fn current_url(&self) -> Result<String>;

    async fn execute(&self, command: &str) -> ExecutionResult;

    /// Takes effect on the next `start`.
    fn set_headless(&mut self, headless: bool);
}

pub struct CommandSandbox {
    launcher: Arc<dyn BrowserLauncher>,
    config: BrowserConfig,
    page: Option<Box<dyn PageDriver>>,
}

impl CommandSandbox {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: BrowserConfig) -> Self {
        Self {
            launcher,
            config,
            page: None,
        }
    }

    /// Sandbox backed by a local Chrome/Chromium.
    pub fn chrome(config: BrowserConfig) -> Self {
        Self::new(Arc::new(ChromeLauncher::new()), config)
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    fn page(&self) -> Result<&dyn PageDriver> {
        self.page
            .as_deref()
            .ok_or_else(|| Error::Session("Browser not initialized".to_string()))
    }

    fn timeout(&self, override_ms: Option<u64>) -> Duration {
        Duration::from_millis(override_ms.unwrap_or(self.config.timeout_ms))
    }

    async fn dispatch(&self, page: &dyn PageDriver, raw: &str) -> Result<Option<Value>> {
        if self.config.enforce_allow_list && !allowlist::is_allowed(raw) {
            return Err(Error::Security(allowlist::clean(raw)));
        }
        let command = command::parse(raw)?;
        debug!(command = command.name(), "Executing command");

        let value = self.run(page, &command).await?;

        if command.is_mutating() {
            let idle = Duration::from_millis(self.config.post_action_idle_timeout_ms);
            if let Err(e) = page.wait_for_load_state(LoadState::NetworkIdle, idle).await {
                debug!(error = %e, "Network did not go idle after action");
            }
        }
        Ok(value)
    }

    async fn run(&self, page: &dyn PageDriver, command: &Command) -> Result<Option<Value>> {
        match command {
            Command::Goto { url, wait_until, timeout_ms } => {
                self.navigate(page, url, wait_until.unwrap_or(LoadState::Load), self.timeout(*timeout_ms))
                    .await?;
                Ok(None)
            }
            Command::Url => Ok(Some(Value::String(page.url().await?))),
            Command::WaitForLoadState { state, timeout_ms } => {
                page.wait_for_load_state(*state, self.timeout(*timeout_ms)).await?;
                Ok(None)
            }
            Command::KeyboardPress(key) => {
                page.keyboard_press(key).await?;
                Ok(None)
            }
            Command::KeyboardType(text) => {
                page.keyboard_type(text).await?;
                Ok(None)
            }
            Command::Element { locator, action, timeout_ms } => {
                let value = page.element(locator, action, self.timeout(*timeout_ms)).await?;
                Ok(if value.is_null() { None } else { Some(value) })
            }
            Command::Expect { locator, assertion, timeout_ms } => {
                self.assert_eventually(page, locator, assertion, self.timeout(*timeout_ms))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn navigate(&self, page: &dyn PageDriver, url: &str, wait_until: LoadState, timeout: Duration) -> Result<()> {
        if url.trim().is_empty() {
            return Err(Error::Navigation("URL cannot be empty".to_string()));
        }
        info!(url = %url, wait_until = %wait_until, "Navigating");
        page.goto(url, wait_until, timeout).await?;

        let readiness = Duration::from_millis(self.config.readiness_timeout_ms);
        if let Err(e) = page.wait_for_load_state(LoadState::NetworkIdle, readiness).await {
            warn!(url = %url, error = %e, "Network idle wait failed after navigation");
        }
        if let Err(e) = page.wait_for_load_state(LoadState::DomContentLoaded, readiness).await {
            warn!(url = %url, error = %e, "DOM content wait failed after navigation");
        }

        let host = url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string));
        if let Some(host) = host {
            if self.config.is_slow_host(&host) {
                debug!(host = %host, "Extra settle wait for slow host");
                tokio::time::sleep(Duration::from_millis(self.config.slow_host_extra_wait_ms)).await;
            }
        }

        let current = page.url().await?;
        if current.is_empty() || current == "about:blank" {
            return Err(Error::Navigation("Page did not load properly".to_string()));
        }
        Ok(())
    }

    /// Re-checks `assertion` until it holds or `timeout` elapses.
    async fn assert_eventually(
        &self,
        page: &dyn PageDriver,
        locator: &Locator,
        assertion: &Assertion,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let observed = match check_assertion(page, locator, assertion).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(observed)) => observed,
                Err(e) => e.to_string(),
            };
            if Instant::now() >= deadline {
                return Err(Error::Command(format!(
                    "expect({}).{} failed after {}ms: {}",
                    locator,
                    assertion.name(),
                    timeout.as_millis(),
                    observed
                )));
            }
            tokio::time::sleep(ASSERT_POLL).await;
        }
    }

    async fn capture(&self, page: &dyn PageDriver, prefix: &str) -> Option<String> {
        let dir = self.config.screenshot_path();
        let path = screenshot_file(&dir, prefix);
        let bytes = match page.screenshot(true).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Failed to take screenshot");
                return None;
            }
        };
        match write_png(&dir, &path, bytes).await {
            Ok(()) => Some(path.display().to_string()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write screenshot");
                None
            }
        }
    }
}

/// `Ok(Err(observed))` means the page answered but the assertion does not hold yet.
async fn check_assertion(
    page: &dyn PageDriver,
    locator: &Locator,
    assertion: &Assertion,
) -> Result<std::result::Result<(), String>> {
    let probe = Duration::ZERO;
    Ok(match assertion {
        Assertion::Visible => match page.element(locator, &ElementAction::IsVisible, probe).await? {
            Value::Bool(true) => Ok(()),
            _ => Err("element is not visible".to_string()),
        },
        Assertion::Text(expected) | Assertion::ContainsText(expected) => {
            let actual = page.element(locator, &ElementAction::TextContent, probe).await?;
            let actual = collapse_whitespace(actual.as_str().unwrap_or_default());
            let expected = collapse_whitespace(expected);
            let holds = match assertion {
                Assertion::Text(_) => actual == expected,
                _ => actual.contains(&expected),
            };
            if holds {
                Ok(())
            } else {
                Err(format!("expected '{}', got '{}'", expected, actual))
            }
        }
        Assertion::Value(expected) => {
            let actual = page.element(locator, &ElementAction::InputValue, probe).await?;
            let actual = actual.as_str().unwrap_or_default();
            if actual == expected {
                Ok(())
            } else {
                Err(format!("expected value '{}', got '{}'", expected, actual))
            }
        }
    })
}

async fn write_png(dir: &Path, path: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, bytes).await
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `<dir>/<prefix>_<YYYYmmdd_HHMMSS_ffffff>_<seq>.png`
pub fn screenshot_file(dir: &Path, prefix: &str) -> PathBuf {
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
    let seq = SCREENSHOT_SEQ.fetch_add(1, Ordering::SeqCst);
    dir.join(format!("{}_{}_{}.png", prefix, ts, seq))
}

#[async_trait]
impl ExecutionSandbox for CommandSandbox {
    async fn start(&mut self) -> Result<()> {
        if self.page.is_some() {
            return Ok(());
        }
        self.config
            .ensure_dirs()
            .map_err(|e| Error::Session(format!("Browser startup failed: {}", e)))?;

        info!(
            headless = self.config.headless,
            width = self.config.viewport_width,
            height = self.config.viewport_height,
            "Starting browser session"
        );
        let page = self
            .launcher
            .launch(&self.config)
            .await
            .map_err(|e| Error::Session(format!("Browser startup failed: {}", e)))?;

        if let Err(e) = page.url().await {
            page.close().await;
            return Err(Error::Session(format!("Browser startup failed: {}", e)));
        }
        self.page = Some(page);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(page) = self.page.take() {
            page.close().await;
            info!("Browser session closed");
        }
    }

    fn is_live(&self) -> bool {
        self.page.is_some()
    }

    async fn page_content(&self) -> Result<String> {
        self.page()?.content().await
    }

    async fn current_url(&self) -> Result<String> {
        self.page()?.url().await
    }

    async fn execute(&self, raw: &str) -> ExecutionResult {
        let started = Instant::now();
        let page = match self.page() {
            Ok(p) => p,
            Err(e) => return ExecutionResult::failure(&e, started.elapsed().as_secs_f64()),
        };

        let outcome = self.dispatch(page, raw).await;
        let prefix = if outcome.is_ok() { "step" } else { "error" };
        let screenshot_path = self.capture(page, prefix).await;
        let page_url = page.url().await.ok();
        let execution_time = started.elapsed().as_secs_f64();

        match outcome {
            Ok(result) => ExecutionResult {
                success: true,
                screenshot_path,
                error_message: None,
                page_url,
                execution_time,
                result,
                error_kind: None,
            },
            Err(e) => {
                warn!(command = %raw, error = %e, "Command failed");
                ExecutionResult {
                    success: false,
                    screenshot_path,
                    error_message: Some(e.to_string()),
                    page_url,
                    execution_time,
                    result: None,
                    error_kind: Some(e.kind()),
                }
            }
        }
    }

    fn set_headless(&mut self, headless: bool) {
        self.config.headless = headless;
    }
}
