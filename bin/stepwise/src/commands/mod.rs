pub mod check_cmd;
pub mod init;
pub mod run_cmd;
pub mod snapshot_cmd;

use std::path::{Path, PathBuf};
use stepwise_core::{Config, Paths};

/// Explicit `--config` file, else `~/.stepwise/config.json` or defaults.
pub fn load_config(paths: &Paths, explicit: Option<&Path>) -> anyhow::Result<Config> {
    match explicit {
        Some(path) => Config::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e)),
        None => Ok(Config::load_or_default(paths)?),
    }
}

pub fn config_path(paths: &Paths, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| paths.config_file())
}
