use std::path::PathBuf;
use std::sync::Arc;
use stepwise_browser::CommandSandbox;
use stepwise_core::config::BrowserProfile;
use stepwise_core::{Config, Paths};
use stepwise_providers::{create_llm_provider, Provider};
use stepwise_runner::{CaseOrchestrator, CaseResult, LlmInstructionGenerator, LlmStepTranslator, StepOrchestrator};
use stepwise_storage::SnapshotStore;
use tracing::info;

/// Runs one case. Returns whether it passed.
pub async fn run(
    explicit_config: Option<PathBuf>,
    url: &str,
    steps: Option<String>,
    steps_file: Option<PathBuf>,
    headed: bool,
    profile: Option<BrowserProfile>,
    json: bool,
) -> anyhow::Result<bool> {
    let steps = match (steps, steps_file) {
        (Some(text), _) => text,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read steps file {}: {}", path.display(), e))?,
        (None, None) => anyhow::bail!("Provide --steps or --steps-file"),
    };
    if steps.trim().is_empty() {
        anyhow::bail!("No test steps given");
    }

    let paths = Paths::new();
    let config = with_profile(super::load_config(&paths, explicit_config.as_deref())?, profile);

    let provider: Arc<dyn Provider> = Arc::from(create_llm_provider(&config)?);
    let translator = Arc::new(LlmStepTranslator::new(provider.clone(), &config.llm));
    let generator = Arc::new(LlmInstructionGenerator::new(provider, &config.llm));

    let mut step_runner = StepOrchestrator::new(generator);
    if config.runner.persist_snapshots {
        let dir = config.snapshot_dir(&paths);
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), format = ?config.storage.snapshot_format, "Persisting snapshots");
        step_runner = step_runner.with_store(Arc::new(SnapshotStore::new(dir, config.storage.snapshot_format)));
    }

    let sandbox = CommandSandbox::chrome(config.browser.clone());
    let mut case = CaseOrchestrator::new(Box::new(sandbox), translator, step_runner, &config);
    let headless_override = headed.then_some(false);
    let result = case.run_case(url, &steps, headless_override).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(result.success)
}

fn with_profile(mut config: Config, profile: Option<BrowserProfile>) -> Config {
    if let Some(profile) = profile {
        info!(profile = %profile, "Applying browser profile");
        config.browser.apply_profile(profile);
    }
    config
}

fn print_summary(result: &CaseResult) {
    println!();
    for (idx, step) in result.steps_results.iter().enumerate() {
        let mark = if step.succeeded() { "PASS" } else { "FAIL" };
        println!("{} {}. {}", mark, idx + 1, step.step.gherkin());
        if !step.executed_command.is_empty() {
            println!("       command:    {}", step.executed_command);
        }
        if let Some(path) = &step.execution_result.screenshot_path {
            println!("       screenshot: {}", path);
        }
        if step.attempts.len() > 1 {
            println!("       attempts:   {}", step.attempts.len());
        }
        println!("       duration:   {:.2}s", step.duration);
    }

    println!();
    if result.success {
        println!("Case passed ({} steps, {:.2}s)", result.steps_results.len(), result.total_duration);
    } else {
        println!("Case failed after {:.2}s", result.total_duration);
        if let Some(message) = &result.error_message {
            println!("  {}", message);
        }
    }
    if let Some(id) = result.request_id() {
        println!("  request id: {}", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_overrides_loaded_config() {
        let mut config = Config::default();
        config.browser.locale = "fr-FR".to_string();
        config.browser.timeout_ms = 10_000;

        let config = with_profile(config, Some(BrowserProfile::Debug));
        assert!(!config.browser.headless);
        assert_eq!(config.browser.timeout_ms, 60_000);
        assert_eq!(config.browser.locale, "fr-FR");
    }

    #[test]
    fn test_no_profile_leaves_config_alone() {
        let config = with_profile(Config::default(), None);
        assert_eq!(config.browser.timeout_ms, 30_000);
        assert_eq!(config.browser.screenshot_dir, "screenshots");
    }
}
