//! In-memory collaborators for orchestration tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stepwise_browser::{
    BrowserLauncher, ElementAction, ExecutionResult, ExecutionSandbox, LoadState, Locator, PageDriver,
};
use stepwise_core::config::BrowserConfig;
use stepwise_core::{Error, ErrorKind, Result, StructuredStep};

use crate::generator::{CandidateInstructionSet, InstructionGenerator, StepTranslator};

const PAGE: &str = "<html><head><title>Login</title></head><body>\
    <input type=\"email\" aria-label=\"Email\"><button>Submit</button></body></html>";

#[derive(Default)]
pub struct SandboxState {
    pub executed: Mutex<Vec<String>>,
    pub url: Mutex<String>,
    pub failing: Mutex<HashSet<String>>,
    pub no_content: bool,
    pub stuck_on_blank: bool,
    pub fail_start: bool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub headless: Mutex<Vec<bool>>,
    live: Mutex<bool>,
}

impl SandboxState {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Executed commands other than navigation and load-state waits.
    pub fn step_commands(&self) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|c| !c.starts_with("goto(") && !c.starts_with("wait_for_load_state("))
            .collect()
    }

    pub fn gotos(&self) -> usize {
        self.executed().iter().filter(|c| c.starts_with("goto(")).count()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

pub struct FakeSandbox {
    state: Arc<SandboxState>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        let state = SandboxState::default();
        *state.url.lock().unwrap() = "about:blank".to_string();
        *state.live.lock().unwrap() = true;
        Self { state: Arc::new(state) }
    }

    fn map(mut self, f: impl FnOnce(&mut SandboxState)) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            f(state);
        }
        self
    }

    pub fn failing(self, commands: &[&str]) -> Self {
        self.state
            .failing
            .lock()
            .unwrap()
            .extend(commands.iter().map(|c| c.to_string()));
        self
    }

    pub fn without_content(self) -> Self {
        self.map(|s| s.no_content = true)
    }

    pub fn stuck_on_blank(self) -> Self {
        self.map(|s| s.stuck_on_blank = true)
    }

    pub fn failing_start(self) -> Self {
        self.map(|s| s.fail_start = true)
    }

    /// Not started yet.
    pub fn idle(self) -> Self {
        *self.state.live.lock().unwrap() = false;
        self
    }

    pub fn state(&self) -> Arc<SandboxState> {
        self.state.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.executed()
    }
}

fn goto_target(command: &str) -> Option<&str> {
    let rest = command.strip_prefix("goto('")?;
    rest.split('\'').next()
}

#[async_trait]
impl ExecutionSandbox for FakeSandbox {
    async fn start(&mut self) -> Result<()> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_start {
            return Err(Error::Session("Browser startup failed: no chrome".to_string()));
        }
        *self.state.live.lock().unwrap() = true;
        Ok(())
    }

    async fn stop(&mut self) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        *self.state.live.lock().unwrap() = false;
    }

    fn is_live(&self) -> bool {
        *self.state.live.lock().unwrap()
    }

    async fn page_content(&self) -> Result<String> {
        if self.state.no_content {
            return Err(Error::Session("page is gone".to_string()));
        }
        Ok(PAGE.to_string())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.state.url.lock().unwrap().clone())
    }

    async fn execute(&self, command: &str) -> ExecutionResult {
        self.state.executed.lock().unwrap().push(command.to_string());
        if let Some(target) = goto_target(command) {
            if !self.state.stuck_on_blank {
                *self.state.url.lock().unwrap() = target.to_string();
            }
        }
        let page_url = Some(self.state.url.lock().unwrap().clone());

        if self.state.failing.lock().unwrap().contains(command) {
            return ExecutionResult {
                success: false,
                screenshot_path: Some("screenshots/error_1.png".to_string()),
                error_message: Some(format!("{} failed", command)),
                page_url,
                execution_time: 0.01,
                result: None,
                error_kind: Some(ErrorKind::Command),
            };
        }
        ExecutionResult {
            success: true,
            screenshot_path: Some("screenshots/step_1.png".to_string()),
            error_message: None,
            page_url,
            execution_time: 0.01,
            result: None,
            error_kind: None,
        }
    }

    fn set_headless(&mut self, headless: bool) {
        self.state.headless.lock().unwrap().push(headless);
    }
}

pub struct FakeGenerator {
    reply: std::result::Result<CandidateInstructionSet, String>,
    requests: Mutex<Vec<(String, String)>>,
}

impl FakeGenerator {
    pub fn with(set: CandidateInstructionSet) -> Self {
        Self {
            reply: Ok(set),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<(String, String)> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl InstructionGenerator for FakeGenerator {
    async fn generate(&self, snapshot_json: &str, step_text: &str) -> Result<CandidateInstructionSet> {
        self.requests
            .lock()
            .unwrap()
            .push((snapshot_json.to_string(), step_text.to_string()));
        self.reply.clone().map_err(Error::Generation)
    }
}

pub struct FakeTranslator {
    reply: std::result::Result<Vec<StructuredStep>, String>,
}

impl FakeTranslator {
    pub fn with(steps: Vec<StructuredStep>) -> Self {
        Self { reply: Ok(steps) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl StepTranslator for FakeTranslator {
    async fn translate(&self, _natural_language_steps: &str) -> Result<Vec<StructuredStep>> {
        self.reply.clone().map_err(Error::Generation)
    }
}

/// Page behind a real `CommandSandbox`: lands wherever it is sent and
/// records every navigation.
#[derive(Default)]
pub struct StaticPage {
    pub url: Mutex<String>,
    pub visits: Mutex<Vec<String>>,
}

struct SharedPage(Arc<StaticPage>);

#[async_trait]
impl PageDriver for SharedPage {
    async fn goto(&self, url: &str, _wait_until: LoadState, _timeout: Duration) -> Result<()> {
        self.0.visits.lock().unwrap().push(url.to_string());
        *self.0.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn wait_for_load_state(&self, _state: LoadState, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn url(&self) -> Result<String> {
        Ok(self.0.url.lock().unwrap().clone())
    }

    async fn content(&self) -> Result<String> {
        Ok(PAGE.to_string())
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn element(&self, _locator: &Locator, _action: &ElementAction, _timeout: Duration) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn keyboard_press(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn keyboard_type(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

pub struct StaticLauncher(pub Arc<StaticPage>);

#[async_trait]
impl BrowserLauncher for StaticLauncher {
    async fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn PageDriver>> {
        Ok(Box::new(SharedPage(self.0.clone())))
    }
}
