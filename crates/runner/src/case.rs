//! One end-to-end case: translate, start the session, navigate, run steps,
//! always clean up.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use stepwise_browser::ExecutionSandbox;
use stepwise_core::{Config, Error, Result, StructuredStep};
use tracing::{debug, error, info, warn};

use crate::generator::StepTranslator;
use crate::result::{seconds_between, CaseResult, StepExecutionResult};
use crate::retry::RetryPolicy;
use crate::step::{is_initial_state_assertion, StepOrchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasePhase {
    Idle,
    GeneratingSteps,
    Navigating,
    ExecutingSteps(usize),
    Cleanup,
    Done,
}

impl fmt::Display for CasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CasePhase::Idle => f.write_str("idle"),
            CasePhase::GeneratingSteps => f.write_str("generating-steps"),
            CasePhase::Navigating => f.write_str("navigating"),
            CasePhase::ExecutingSteps(n) => write!(f, "executing-steps{{{}}}", n),
            CasePhase::Cleanup => f.write_str("cleanup"),
            CasePhase::Done => f.write_str("done"),
        }
    }
}

/// How the step loop ended when nothing fatal happened.
enum Outcome {
    Passed,
    StepFailed(String),
}

pub struct CaseOrchestrator {
    sandbox: Box<dyn ExecutionSandbox>,
    translator: Arc<dyn StepTranslator>,
    steps: StepOrchestrator,
    navigation: RetryPolicy,
    default_headless: bool,
    phase: CasePhase,
}

impl CaseOrchestrator {
    pub fn new(
        sandbox: Box<dyn ExecutionSandbox>,
        translator: Arc<dyn StepTranslator>,
        steps: StepOrchestrator,
        config: &Config,
    ) -> Self {
        Self {
            sandbox,
            translator,
            steps,
            navigation: RetryPolicy::fixed(
                config.runner.navigation_attempts,
                Duration::from_millis(config.runner.navigation_backoff_ms),
            ),
            default_headless: config.browser.headless,
            phase: CasePhase::Idle,
        }
    }

    pub fn with_navigation_retry(mut self, policy: RetryPolicy) -> Self {
        self.navigation = policy;
        self
    }

    pub fn phase(&self) -> CasePhase {
        self.phase
    }

    fn enter(&mut self, phase: CasePhase) {
        debug!(from = %self.phase, to = %phase, "Case phase");
        self.phase = phase;
    }

    /// Never fails: every error ends up in `CaseResult::error_message`.
    pub async fn run_case(&mut self, url: &str, natural_language_steps: &str, headless_override: Option<bool>) -> CaseResult {
        let start_time = Utc::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut metadata = BTreeMap::new();
        metadata.insert("request_id".to_string(), Value::String(request_id.clone()));
        metadata.insert("url".to_string(), Value::String(url.to_string()));

        info!(request_id = %request_id, url = %url, "Running case");
        if let Some(headless) = headless_override {
            self.sandbox.set_headless(headless);
        }

        let mut steps_results = Vec::new();
        let mut step_count = 0;
        let outcome = self
            .drive(&request_id, url, natural_language_steps, &mut step_count, &mut steps_results)
            .await;

        self.enter(CasePhase::Cleanup);
        self.sandbox.stop().await;
        if headless_override.is_some() {
            self.sandbox.set_headless(self.default_headless);
        }
        self.enter(CasePhase::Done);

        let (success, error_message) = match outcome {
            Ok(Outcome::Passed) => (true, None),
            Ok(Outcome::StepFailed(message)) => (false, Some(message)),
            Err(message) => {
                error!(request_id = %request_id, error = %message, "Case failed");
                (false, Some(message))
            }
        };
        metadata.insert("step_count".to_string(), json!(step_count));

        let end_time = Utc::now();
        info!(
            request_id = %request_id,
            success,
            steps = steps_results.len(),
            "Case finished"
        );
        CaseResult {
            success,
            steps_results,
            start_time,
            end_time,
            total_duration: seconds_between(start_time, end_time),
            error_message,
            metadata,
        }
    }

    /// Everything before cleanup. `Err` carries the case-level message.
    async fn drive(
        &mut self,
        request_id: &str,
        url: &str,
        natural_language_steps: &str,
        step_count: &mut usize,
        results: &mut Vec<StepExecutionResult>,
    ) -> std::result::Result<Outcome, String> {
        validate_url(url).map_err(|e| e.to_string())?;

        self.enter(CasePhase::GeneratingSteps);
        let steps = self.translate(natural_language_steps).await?;
        *step_count = steps.len();

        self.sandbox.start().await.map_err(|e| e.to_string())?;

        self.enter(CasePhase::Navigating);
        self.navigate(url).await.map_err(|e| e.to_string())?;

        let nl_lines: Vec<&str> = natural_language_steps
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let orchestrator = self.steps.for_run(request_id);

        for (idx, step) in steps.iter().enumerate() {
            if is_initial_state_assertion(idx, step) {
                debug!(step = %step.gherkin(), "Skipping initial-state assertion");
                continue;
            }
            self.enter(CasePhase::ExecutingSteps(results.len()));
            info!(step = idx + 1, total = steps.len(), gherkin = %step.gherkin(), "Executing step");

            let line = nl_lines.get(idx).copied().unwrap_or_default();
            let result = orchestrator.execute_step(self.sandbox.as_ref(), line, step).await;
            let failure = (!result.succeeded()).then(|| {
                result
                    .execution_result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("Step {} failed", idx + 1))
            });
            results.push(result);

            if let Some(message) = failure {
                warn!(step = idx + 1, error = %message, "Step failed, stopping case");
                return Ok(Outcome::StepFailed(message));
            }
        }
        Ok(Outcome::Passed)
    }

    async fn translate(&self, natural_language_steps: &str) -> std::result::Result<Vec<StructuredStep>, String> {
        let steps = self
            .translator
            .translate(natural_language_steps)
            .await
            .map_err(|e| format!("Step generation error: {}", e))?;
        if steps.is_empty() {
            return Err(Error::Validation("No steps were generated from the natural language input".to_string()).to_string());
        }
        info!(step_count = steps.len(), "Steps generated");
        Ok(steps)
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let command = navigation_command(url);

        for attempt in self.navigation.attempts() {
            debug!(attempt, max_attempts = self.navigation.max_attempts, url = %url, "Navigation attempt");
            match self.try_navigate(&command, url).await {
                Ok(current) => {
                    info!(url = %current, attempt, "Navigation succeeded");
                    return Ok(());
                }
                Err(e) => warn!(attempt, error = %e, "Navigation attempt failed"),
            }
            if let Some(delay) = self.navigation.delay_for(attempt) {
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::Navigation(format!(
            "Failed to navigate to {} after {} attempts",
            url, self.navigation.max_attempts
        )))
    }

    async fn try_navigate(&self, command: &str, url: &str) -> Result<String> {
        let nav = self.sandbox.execute(command).await;
        if !nav.success {
            return Err(Error::Navigation(
                nav.error_message.unwrap_or_else(|| "Navigation command failed".to_string()),
            ));
        }

        let current = self.sandbox.current_url().await?;
        if current.is_empty() {
            return Err(Error::Navigation("Current URL is empty".to_string()));
        }
        if current.contains("about:blank") {
            return Err(Error::Navigation("Page stuck at about:blank".to_string()));
        }
        if !url_matches(url, &current) {
            return Err(Error::Navigation(format!("Expected URL not found. Expected: {}, Got: {}", url, current)));
        }

        let ready = self.sandbox.execute("wait_for_load_state('domcontentloaded')").await;
        if !ready.success {
            return Err(Error::Navigation(format!(
                "Page readiness check failed: {}",
                ready.error_message.unwrap_or_default()
            )));
        }
        Ok(current)
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).map_err(|e| Error::Validation(format!("Invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Validation(format!("Unsupported URL scheme '{}' in {}", other, url))),
    }
}

/// The `goto` instruction for a case URL, quoted the way the command
/// parser and allow-list expect.
pub fn navigation_command(url: &str) -> String {
    format!("goto('{}', wait_until='networkidle')", url.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// `current` contains `expected`, ignoring trailing slashes on either side.
pub fn url_matches(expected: &str, current: &str) -> bool {
    let expected = expected.trim().trim_end_matches('/');
    let current = current.trim().trim_end_matches('/');
    !expected.is_empty() && current.contains(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::CandidateInstructionSet;
    use crate::testing::{FakeGenerator, FakeSandbox, FakeTranslator, StaticLauncher, StaticPage};
    use stepwise_browser::CommandSandbox;
    use stepwise_core::StepAction;

    const LOGIN: &str = "https://example.test/login";

    fn fast() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::ZERO)
    }

    fn input_and_click() -> Vec<StructuredStep> {
        vec![
            StructuredStep::new(
                "When I enter \"user@test.com\" into the email field",
                StepAction::Input,
                "email field",
                Some("user@test.com".to_string()),
            )
            .unwrap(),
            StructuredStep::new("And I click submit", StepAction::Click, "submit", None).unwrap(),
        ]
    }

    fn case(sandbox: FakeSandbox, translator: FakeTranslator, high: &[&str], low: &[&str]) -> CaseOrchestrator {
        let generator = Arc::new(FakeGenerator::with(CandidateInstructionSet {
            high_precision: high.iter().map(|s| s.to_string()).collect(),
            low_precision: low.iter().map(|s| s.to_string()).collect(),
        }));
        CaseOrchestrator::new(
            Box::new(sandbox),
            Arc::new(translator),
            StepOrchestrator::new(generator),
            &Config::default(),
        )
        .with_navigation_retry(fast())
    }

    #[test]
    fn test_url_matches_tolerates_trailing_slash() {
        assert!(url_matches("https://example.test", "https://example.test/"));
        assert!(url_matches("https://example.test/", "https://example.test"));
        assert!(url_matches("https://example.test/login", "https://example.test/login?next=%2F"));
        assert!(!url_matches("https://example.test/login", "https://example.test/home"));
        assert!(!url_matches("", "https://example.test"));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CasePhase::GeneratingSteps.to_string(), "generating-steps");
        assert_eq!(CasePhase::ExecutingSteps(2).to_string(), "executing-steps{2}");
    }

    #[tokio::test]
    async fn test_two_step_case_succeeds() {
        let sandbox = FakeSandbox::new().idle();
        let state = sandbox.state();
        let mut runner = case(sandbox, FakeTranslator::with(input_and_click()), &["page.get_by_label('Email').fill('user@test.com')"], &[]);

        let result = runner
            .run_case(LOGIN, "Enter \"user@test.com\" into email field\nClick submit", None)
            .await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.steps_results.len(), 2);
        for step in &result.steps_results {
            assert!(step.execution_result.screenshot_path.is_some());
        }
        assert_eq!(result.steps_results[0].natural_language_step, "Enter \"user@test.com\" into email field");
        assert_eq!(result.steps_results[1].natural_language_step, "Click submit");
        assert!(result.error_message.is_none());
        assert_eq!(result.metadata["url"], LOGIN);
        assert_eq!(result.metadata["step_count"], 2);
        assert_eq!(result.request_id().map(str::len), Some(36));
        assert_eq!(state.stops(), 1);
        assert_eq!(state.gotos(), 1);
        assert_eq!(runner.phase(), CasePhase::Done);
    }

    #[tokio::test]
    async fn test_navigation_exhaustion_attempts_no_steps() {
        let sandbox = FakeSandbox::new().stuck_on_blank();
        let state = sandbox.state();
        let mut runner = case(sandbox, FakeTranslator::with(input_and_click()), &["cmdA"], &[]);

        let result = runner.run_case(LOGIN, "Click submit", None).await;

        assert!(!result.success);
        let message = result.error_message.unwrap();
        assert!(message.contains(&format!("Failed to navigate to {} after 3 attempts", LOGIN)), "{}", message);
        assert!(result.steps_results.is_empty());
        assert_eq!(state.gotos(), 3);
        assert!(state.step_commands().is_empty());
        assert_eq!(state.stops(), 1);
    }

    #[tokio::test]
    async fn test_step_failure_stops_case() {
        let sandbox = FakeSandbox::new().failing(&["cmdA", "cmdB"]);
        let state = sandbox.state();
        let mut runner = case(sandbox, FakeTranslator::with(input_and_click()), &["cmdA"], &["cmdB"]);

        let result = runner.run_case(LOGIN, "a\nb", None).await;

        assert!(!result.success);
        assert_eq!(result.steps_results.len(), 1);
        assert_eq!(result.error_message.as_deref(), Some("cmdB failed"));
        assert_eq!(state.step_commands(), vec!["cmdA", "cmdB"]);
        assert_eq!(state.stops(), 1);
    }

    #[tokio::test]
    async fn test_translator_failure_skips_session() {
        let sandbox = FakeSandbox::new().idle();
        let state = sandbox.state();
        let mut runner = case(sandbox, FakeTranslator::failing("upstream 500"), &["cmdA"], &[]);

        let result = runner.run_case(LOGIN, "Click submit", None).await;

        assert!(!result.success);
        assert!(result.error_message.as_ref().unwrap().starts_with("Step generation error:"));
        assert_eq!(state.starts.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(state.stops(), 1);
        assert!(result.request_id().is_some());
        assert_eq!(result.metadata["step_count"], 0);
    }

    #[tokio::test]
    async fn test_empty_translation_is_validation_error() {
        let sandbox = FakeSandbox::new();
        let state = sandbox.state();
        let mut runner = case(sandbox, FakeTranslator::with(Vec::new()), &["cmdA"], &[]);

        let result = runner.run_case(LOGIN, "", None).await;

        let message = result.error_message.unwrap();
        assert!(message.starts_with("Validation error:"), "{}", message);
        assert!(!message.contains("Step generation error"));
        assert_eq!(state.stops(), 1);
    }

    #[tokio::test]
    async fn test_startup_failure_still_cleans_up() {
        let sandbox = FakeSandbox::new().idle().failing_start();
        let state = sandbox.state();
        let mut runner = case(sandbox, FakeTranslator::with(input_and_click()), &["cmdA"], &[]);

        let result = runner.run_case(LOGIN, "a\nb", None).await;

        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("Browser startup failed"));
        assert_eq!(state.gotos(), 0);
        assert_eq!(state.stops(), 1);
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_session() {
        let sandbox = FakeSandbox::new().idle();
        let state = sandbox.state();
        let mut runner = case(sandbox, FakeTranslator::with(input_and_click()), &["cmdA"], &[]);

        let result = runner.run_case("file:///etc/passwd", "a", None).await;

        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("Unsupported URL scheme"));
        assert_eq!(state.starts.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(state.stops(), 1);
    }

    #[tokio::test]
    async fn test_initial_state_assertion_is_skipped() {
        let mut steps = vec![StructuredStep::new(
            "Given I am on the login page",
            StepAction::Navigate,
            "login page",
            None,
        )
        .unwrap()];
        steps.extend(input_and_click());
        let sandbox = FakeSandbox::new();
        let mut runner = case(sandbox, FakeTranslator::with(steps), &["cmdA"], &[]);

        let result = runner
            .run_case(LOGIN, "I am on the login page\nEnter email\nClick submit", None)
            .await;

        assert!(result.success);
        assert_eq!(result.steps_results.len(), 2);
        assert_eq!(result.steps_results[0].step.action(), StepAction::Input);
        assert_eq!(result.steps_results[0].natural_language_step, "Enter email");
        assert_eq!(result.metadata["step_count"], 3);
    }

    #[tokio::test]
    async fn test_headless_override_is_restored() {
        let sandbox = FakeSandbox::new();
        let state = sandbox.state();
        let mut runner = case(sandbox, FakeTranslator::with(input_and_click()), &["cmdA"], &[]);

        runner.run_case(LOGIN, "a\nb", Some(false)).await;
        assert_eq!(*state.headless.lock().unwrap(), vec![false, true]);

        runner.run_case(LOGIN, "a\nb", None).await;
        assert_eq!(state.headless.lock().unwrap().len(), 2);
        assert_eq!(state.stops(), 2);
    }

    #[test]
    fn test_navigation_command_quotes_url() {
        assert_eq!(
            navigation_command("https://example.test/o'brien"),
            r"goto('https://example.test/o\'brien', wait_until='networkidle')"
        );
        assert_eq!(
            navigation_command(r"https://example.test/a\b"),
            r"goto('https://example.test/a\\b', wait_until='networkidle')"
        );
    }

    #[tokio::test]
    async fn test_apostrophe_url_passes_the_command_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.browser.screenshot_dir = dir.path().join("shots").display().to_string();
        config.browser.trace_dir = dir.path().join("traces").display().to_string();
        config.browser.slow_hosts = vec![];
        assert!(config.browser.enforce_allow_list);

        let page = Arc::new(StaticPage::default());
        let sandbox = CommandSandbox::new(Arc::new(StaticLauncher(page.clone())), config.browser.clone());
        let steps = vec![
            StructuredStep::new("Given I am on the profile page", StepAction::Navigate, "profile page", None).unwrap(),
            StructuredStep::new("When I click submit", StepAction::Click, "submit", None).unwrap(),
        ];
        let generator = Arc::new(FakeGenerator::with(CandidateInstructionSet {
            high_precision: vec!["page.get_by_role('button', name='Submit').click()".to_string()],
            low_precision: vec![],
        }));
        let mut runner = CaseOrchestrator::new(
            Box::new(sandbox),
            Arc::new(FakeTranslator::with(steps)),
            StepOrchestrator::new(generator),
            &config,
        )
        .with_navigation_retry(fast());

        let url = "https://example.test/o'brien";
        let result = runner
            .run_case(url, "I am on the profile page\nClick submit", None)
            .await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(*page.visits.lock().unwrap(), vec![url.to_string()]);
        assert_eq!(result.steps_results.len(), 1);
        assert!(result.steps_results[0].succeeded());
    }
}
