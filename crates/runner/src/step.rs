//! Runs one structured step against a live sandbox: snapshot, generate,
//! then try candidates high tier first until one succeeds.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use stepwise_browser::{ExecutionResult, ExecutionSandbox, SemanticNode, SnapshotBuilder};
use stepwise_core::{Error, StepAction, StructuredStep};
use stepwise_storage::{SnapshotEntry, SnapshotStore};
use tracing::{debug, info, warn};

use crate::generator::InstructionGenerator;
use crate::result::{seconds_between, Attempt, StepExecutionResult, Tier};

/// True for a leading `navigate` step that only restates where the case starts.
pub fn is_initial_state_assertion(idx: usize, step: &StructuredStep) -> bool {
    idx == 0 && step.action() == StepAction::Navigate && step.gherkin().to_lowercase().contains("am on")
}

#[derive(Clone)]
pub struct StepOrchestrator {
    generator: Arc<dyn InstructionGenerator>,
    builder: SnapshotBuilder,
    store: Option<Arc<SnapshotStore>>,
    run_id: String,
}

impl StepOrchestrator {
    pub fn new(generator: Arc<dyn InstructionGenerator>) -> Self {
        Self {
            generator,
            builder: SnapshotBuilder::default(),
            store: None,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_snapshot_builder(mut self, builder: SnapshotBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Persist every pre-step snapshot.
    pub fn with_store(mut self, store: Arc<SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Same orchestrator, filing snapshots under `run_id`.
    pub fn for_run(&self, run_id: &str) -> Self {
        let mut scoped = self.clone();
        scoped.run_id = run_id.to_string();
        scoped
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn execute_step(
        &self,
        sandbox: &dyn ExecutionSandbox,
        natural_language_step: &str,
        step: &StructuredStep,
    ) -> StepExecutionResult {
        let start_time = Utc::now();
        let clock = Instant::now();

        let snapshot = match self.capture_snapshot(sandbox, step).await {
            Ok(s) => s,
            Err(e) => {
                warn!(step = %step.gherkin(), error = %e, "Snapshot capture failed");
                let outcome = self.failed(sandbox, &e, clock).await;
                return finish(natural_language_step, step, outcome, String::new(), SemanticNode::new("WebArea", ""), Vec::new(), start_time);
            }
        };

        let candidates = match self.generate(&snapshot, step).await {
            Ok(set) => set,
            Err(e) => {
                warn!(step = %step.gherkin(), error = %e, "Instruction generation failed");
                let outcome = self.failed(sandbox, &e, clock).await;
                return finish(natural_language_step, step, outcome, String::new(), snapshot, Vec::new(), start_time);
            }
        };

        let tiers = [
            (Tier::High, &candidates.high_precision),
            (Tier::Low, &candidates.low_precision),
        ];
        let mut attempts = Vec::with_capacity(candidates.len());
        let mut last: Option<(String, ExecutionResult)> = None;

        for (tier, commands) in tiers {
            for command in commands.iter() {
                debug!(tier = ?tier, command = %command, "Trying instruction");
                let result = sandbox.execute(command).await;
                attempts.push(Attempt {
                    tier,
                    command: command.clone(),
                    success: result.success,
                    error_message: result.error_message.clone(),
                });
                if result.success {
                    info!(tier = ?tier, command = %command, attempts = attempts.len(), "Instruction succeeded");
                    return finish(natural_language_step, step, result, command.clone(), snapshot, attempts, start_time);
                }
                debug!(tier = ?tier, error = ?result.error_message, "Instruction failed");
                last = Some((command.clone(), result));
            }
        }

        // Both tiers exhausted: surface the last real failure.
        warn!(step = %step.gherkin(), attempts = attempts.len(), "All instructions failed");
        match last {
            Some((command, result)) => finish(natural_language_step, step, result, command, snapshot, attempts, start_time),
            None => {
                let err = Error::Generation(format!("No instruction found for step: {}", step.gherkin()));
                let outcome = self.failed(sandbox, &err, clock).await;
                finish(natural_language_step, step, outcome, String::new(), snapshot, attempts, start_time)
            }
        }
    }

    async fn capture_snapshot(&self, sandbox: &dyn ExecutionSandbox, step: &StructuredStep) -> stepwise_core::Result<SemanticNode> {
        let markup = sandbox.page_content().await?;
        let snapshot = self.builder.build(Some(&markup))?;
        debug!(nodes = snapshot.count(), "Semantic snapshot built");

        if let Some(store) = &self.store {
            let entry = SnapshotEntry::new(
                step.gherkin(),
                step.action().as_str(),
                sandbox.current_url().await.ok(),
                serde_json::to_value(&snapshot)?,
            );
            if let Err(e) = store.append(&self.run_id, &entry) {
                warn!(run_id = %self.run_id, error = %e, "Failed to persist snapshot");
            }
        }
        Ok(snapshot)
    }

    async fn generate(
        &self,
        snapshot: &SemanticNode,
        step: &StructuredStep,
    ) -> stepwise_core::Result<crate::generator::CandidateInstructionSet> {
        let snapshot_json = snapshot.to_json_pretty()?;
        let candidates = self.generator.generate(&snapshot_json, step.gherkin()).await?;
        if candidates.is_empty() {
            return Err(Error::Generation(format!("No instruction found for step: {}", step.gherkin())));
        }
        Ok(candidates)
    }

    async fn failed(&self, sandbox: &dyn ExecutionSandbox, err: &Error, clock: Instant) -> ExecutionResult {
        let mut outcome = ExecutionResult::failure(err, clock.elapsed().as_secs_f64());
        outcome.page_url = sandbox.current_url().await.ok();
        outcome
    }
}

fn finish(
    natural_language_step: &str,
    step: &StructuredStep,
    execution_result: ExecutionResult,
    executed_command: String,
    snapshot_before: SemanticNode,
    attempts: Vec<Attempt>,
    start_time: chrono::DateTime<Utc>,
) -> StepExecutionResult {
    let end_time = Utc::now();
    StepExecutionResult {
        natural_language_step: natural_language_step.to_string(),
        step: step.clone(),
        execution_result,
        executed_command,
        snapshot_before,
        attempts,
        start_time,
        end_time,
        duration: seconds_between(start_time, end_time),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::CandidateInstructionSet;
    use crate::testing::{FakeGenerator, FakeSandbox};
    use stepwise_core::config::SnapshotFormat;
    use stepwise_core::ErrorKind;

    fn click_step() -> StructuredStep {
        StructuredStep::new("When I click submit", StepAction::Click, "submit", None).unwrap()
    }

    fn orchestrator(high: &[&str], low: &[&str]) -> (StepOrchestrator, Arc<FakeGenerator>) {
        let generator = Arc::new(FakeGenerator::with(CandidateInstructionSet {
            high_precision: high.iter().map(|s| s.to_string()).collect(),
            low_precision: low.iter().map(|s| s.to_string()).collect(),
        }));
        (StepOrchestrator::new(generator.clone()), generator)
    }

    #[test]
    fn test_initial_state_assertion() {
        let nav = StructuredStep::new("Given I am on the login page", StepAction::Navigate, "login page", None).unwrap();
        assert!(is_initial_state_assertion(0, &nav));
        assert!(!is_initial_state_assertion(1, &nav));
        let go = StructuredStep::new("When I go to settings", StepAction::Navigate, "settings", None).unwrap();
        assert!(!is_initial_state_assertion(0, &go));
        let verify = StructuredStep::new("Then I AM ON home", StepAction::Verify, "home", None).unwrap();
        assert!(!is_initial_state_assertion(0, &verify));
    }

    #[tokio::test]
    async fn test_first_success_stops_tier_walk() {
        let sandbox = FakeSandbox::new().failing(&["cmdA"]);
        let (steps, _) = orchestrator(&["cmdA", "cmdB"], &["cmdC"]);
        let result = steps.execute_step(&sandbox, "Click submit", &click_step()).await;

        assert!(result.succeeded());
        assert_eq!(result.executed_command, "cmdB");
        assert_eq!(sandbox.executed(), vec!["cmdA", "cmdB"]);
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.attempts[0].tier, Tier::High);
        assert!(!result.attempts[0].success);
        assert_eq!(result.natural_language_step, "Click submit");
        assert_eq!(result.snapshot_before.role, "WebArea");
    }

    #[tokio::test]
    async fn test_low_tier_runs_after_high_tier_fails() {
        let sandbox = FakeSandbox::new().failing(&["cmdA", "cmdB"]);
        let (steps, _) = orchestrator(&["cmdA", "cmdB"], &["cmdC"]);
        let result = steps.execute_step(&sandbox, "", &click_step()).await;

        assert!(result.succeeded());
        assert_eq!(result.executed_command, "cmdC");
        assert_eq!(result.attempts.last().unwrap().tier, Tier::Low);
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_failure() {
        let sandbox = FakeSandbox::new().failing(&["cmdA", "cmdB", "cmdC"]);
        let (steps, _) = orchestrator(&["cmdA", "cmdB"], &["cmdC"]);
        let result = steps.execute_step(&sandbox, "", &click_step()).await;

        assert!(!result.succeeded());
        assert_eq!(result.executed_command, "cmdC");
        assert_eq!(result.execution_result.error_message.as_deref(), Some("cmdC failed"));
        assert_eq!(result.attempts.len(), 3);
        assert!(result.end_time >= result.start_time);
    }

    #[tokio::test]
    async fn test_generation_error_attempts_nothing() {
        let sandbox = FakeSandbox::new();
        let generator = Arc::new(FakeGenerator::failing("Failed to parse AI response as JSON"));
        let steps = StepOrchestrator::new(generator);
        let result = steps.execute_step(&sandbox, "", &click_step()).await;

        assert!(!result.succeeded());
        assert_eq!(result.execution_result.error_kind, Some(ErrorKind::Generation));
        assert!(result.executed_command.is_empty());
        assert!(sandbox.executed().is_empty());
    }

    #[tokio::test]
    async fn test_empty_candidates_is_no_instruction_found() {
        let sandbox = FakeSandbox::new();
        let (steps, _) = orchestrator(&[], &[]);
        let result = steps.execute_step(&sandbox, "", &click_step()).await;

        assert!(!result.succeeded());
        let message = result.execution_result.error_message.unwrap();
        assert!(message.contains("No instruction found"));
        assert!(sandbox.executed().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_page_fails_step() {
        let sandbox = FakeSandbox::new().without_content();
        let (steps, generator) = orchestrator(&["cmdA"], &[]);
        let result = steps.execute_step(&sandbox, "", &click_step()).await;

        assert!(!result.succeeded());
        assert_eq!(generator.calls(), 0);
        assert!(sandbox.executed().is_empty());
    }

    #[tokio::test]
    async fn test_generator_sees_snapshot_and_gherkin() {
        let sandbox = FakeSandbox::new();
        let (steps, generator) = orchestrator(&["cmdA"], &[]);
        steps.execute_step(&sandbox, "", &click_step()).await;

        let (snapshot, text) = generator.last_request().unwrap();
        assert_eq!(text, "When I click submit");
        assert!(snapshot.contains("\"WebArea\""));
        assert!(snapshot.contains("Submit"));
    }

    #[tokio::test]
    async fn test_snapshots_persist_under_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path().to_path_buf(), SnapshotFormat::Jsonl));
        let sandbox = FakeSandbox::new();
        let (steps, _) = orchestrator(&["cmdA"], &[]);
        let steps = steps.with_store(store.clone()).for_run("run-1");

        steps.execute_step(&sandbox, "", &click_step()).await;
        steps.execute_step(&sandbox, "", &click_step()).await;

        let entries = store.load("run-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "click");
        assert_eq!(entries[0].snapshot["role"], "WebArea");
    }
}
