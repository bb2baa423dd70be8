use std::path::PathBuf;
use stepwise_core::{Config, Paths};

pub async fn run(explicit: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = super::config_path(&paths, explicit);

    if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    paths.ensure_dirs()?;
    Config::default().save(&config_path)?;

    println!("Wrote {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Add an API key under \"providers\" (openai, anthropic, openrouter, ...)");
    println!("  2. Set \"llm.model\", e.g. \"gpt-4o\" or \"claude-3-5-sonnet-latest\"");
    println!("  3. stepwise run --url https://example.com --steps \"Click the More information link\"");
    Ok(())
}
