use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    /// `Some("")` forces a direct connection for this provider.
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Explicit provider name. Inferred from the model string when absent.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,
    #[serde(default = "default_llm_retry_delay_ms")]
    pub llm_retry_delay_ms: u64,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.0
}

fn default_llm_max_retries() -> u32 {
    3
}

fn default_llm_retry_delay_ms() -> u64 {
    2000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            provider: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            llm_max_retries: default_llm_max_retries(),
            llm_retry_delay_ms: default_llm_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,
    /// Upper bound for every individual browser wait.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: String,
    #[serde(default = "default_trace_dir")]
    pub trace_dir: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// When false, any command the parser understands may run. Trusted use only.
    #[serde(default = "default_true")]
    pub enforce_allow_list: bool,
    /// Hosts that get an extra settle wait after navigation.
    #[serde(default = "default_slow_hosts")]
    pub slow_hosts: Vec<String>,
    #[serde(default = "default_slow_host_extra_wait_ms")]
    pub slow_host_extra_wait_ms: u64,
    #[serde(default)]
    pub chrome_path: Option<String>,
    /// Quiet window with no in-flight requests that counts as network idle.
    #[serde(default = "default_network_idle_ms")]
    pub network_idle_ms: u64,
    #[serde(default = "default_post_action_idle_timeout_ms")]
    pub post_action_idle_timeout_ms: u64,
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_viewport_width() -> u32 {
    1920
}

fn default_viewport_height() -> u32 {
    1080
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_screenshot_dir() -> String {
    "screenshots".to_string()
}

fn default_trace_dir() -> String {
    "traces".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string()
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_slow_hosts() -> Vec<String> {
    vec!["google.com".to_string()]
}

fn default_slow_host_extra_wait_ms() -> u64 {
    2000
}

fn default_network_idle_ms() -> u64 {
    500
}

fn default_post_action_idle_timeout_ms() -> u64 {
    5000
}

fn default_readiness_timeout_ms() -> u64 {
    5000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            timeout_ms: default_timeout_ms(),
            screenshot_dir: default_screenshot_dir(),
            trace_dir: default_trace_dir(),
            user_agent: default_user_agent(),
            locale: default_locale(),
            timezone: default_timezone(),
            enforce_allow_list: true,
            slow_hosts: default_slow_hosts(),
            slow_host_extra_wait_ms: default_slow_host_extra_wait_ms(),
            chrome_path: None,
            network_idle_ms: default_network_idle_ms(),
            post_action_idle_timeout_ms: default_post_action_idle_timeout_ms(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
        }
    }
}

impl BrowserConfig {
    pub fn screenshot_path(&self) -> PathBuf {
        PathBuf::from(&self.screenshot_dir)
    }

    /// Creates the screenshot and trace directories if they are missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.screenshot_dir)?;
        std::fs::create_dir_all(&self.trace_dir)?;
        Ok(())
    }

    /// True when `host` equals a slow host or is a subdomain of one.
    pub fn is_slow_host(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.slow_hosts.iter().any(|h| {
            let h = h.trim().to_lowercase();
            !h.is_empty() && (host == h || host.ends_with(&format!(".{}", h)))
        })
    }
}

/// Named browser presets. A profile overrides only the fields it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserProfile {
    /// Headed, 1280x530, 60 s waits.
    Debug,
    /// Headless, 15 s waits.
    Test,
    /// Headless, 45 s waits.
    Production,
    /// Headless phone viewport (375x812).
    Mobile,
}

impl BrowserProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Test => "test",
            Self::Production => "production",
            Self::Mobile => "mobile",
        }
    }
}

impl std::fmt::Display for BrowserProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BrowserProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            "mobile" => Ok(Self::Mobile),
            other => Err(format!(
                "unknown browser profile '{}' (expected debug, test, production or mobile)",
                other
            )),
        }
    }
}

impl BrowserConfig {
    pub fn for_profile(profile: BrowserProfile) -> Self {
        let mut config = Self::default();
        config.apply_profile(profile);
        config
    }

    pub fn apply_profile(&mut self, profile: BrowserProfile) {
        match profile {
            BrowserProfile::Debug => {
                self.headless = false;
                self.viewport_width = 1280;
                self.viewport_height = 530;
                self.timeout_ms = 60_000;
                self.screenshot_dir = "debug_screenshots".to_string();
                self.trace_dir = "debug_traces".to_string();
            }
            BrowserProfile::Test => {
                self.headless = true;
                self.timeout_ms = 15_000;
                self.screenshot_dir = "test_screenshots".to_string();
                self.trace_dir = "test_traces".to_string();
            }
            BrowserProfile::Production => {
                self.headless = true;
                self.timeout_ms = 45_000;
                self.screenshot_dir = "production_screenshots".to_string();
                self.trace_dir = "production_traces".to_string();
            }
            BrowserProfile::Mobile => {
                self.headless = true;
                self.viewport_width = 375;
                self.viewport_height = 812;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    #[serde(default = "default_navigation_attempts")]
    pub navigation_attempts: u32,
    #[serde(default = "default_navigation_backoff_ms")]
    pub navigation_backoff_ms: u64,
    /// Dump every pre-step snapshot through the snapshot store.
    #[serde(default)]
    pub persist_snapshots: bool,
}

fn default_navigation_attempts() -> u32 {
    3
}

fn default_navigation_backoff_ms() -> u64 {
    1000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            navigation_attempts: default_navigation_attempts(),
            navigation_backoff_ms: default_navigation_backoff_ms(),
            persist_snapshots: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Json,
    Jsonl,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub snapshot_format: SnapshotFormat,
    /// Overrides `~/.stepwise/snapshots`.
    #[serde(default)]
    pub snapshot_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("openai".to_string(), ProviderConfig::default());
        providers.insert("anthropic".to_string(), ProviderConfig::default());
        providers.insert("openrouter".to_string(), ProviderConfig {
            api_key: String::new(),
            api_base: Some("https://openrouter.ai/api/v1".to_string()),
            proxy: None,
        });

        Self {
            providers,
            network: NetworkConfig::default(),
            llm: LlmConfig::default(),
            browser: BrowserConfig::default(),
            runner: RunnerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn snapshot_dir(&self, paths: &Paths) -> PathBuf {
        match &self.storage.snapshot_dir {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => paths.snapshots_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_profile() {
        let cfg = BrowserConfig::for_profile(BrowserProfile::Debug);
        assert!(!cfg.headless);
        assert_eq!((cfg.viewport_width, cfg.viewport_height), (1280, 530));
        assert_eq!(cfg.timeout_ms, 60_000);
        assert_eq!(cfg.screenshot_dir, "debug_screenshots");
        assert_eq!(cfg.trace_dir, "debug_traces");
    }

    #[test]
    fn test_test_profile() {
        let cfg = BrowserConfig::for_profile(BrowserProfile::Test);
        assert!(cfg.headless);
        assert_eq!((cfg.viewport_width, cfg.viewport_height), (1920, 1080));
        assert_eq!(cfg.timeout_ms, 15_000);
        assert_eq!(cfg.screenshot_dir, "test_screenshots");
        assert_eq!(cfg.trace_dir, "test_traces");
    }

    #[test]
    fn test_production_profile() {
        let cfg = BrowserConfig::for_profile(BrowserProfile::Production);
        assert!(cfg.headless);
        assert_eq!(cfg.timeout_ms, 45_000);
        assert_eq!(cfg.screenshot_dir, "production_screenshots");
        assert_eq!(cfg.trace_dir, "production_traces");
    }

    #[test]
    fn test_mobile_profile() {
        let cfg = BrowserConfig::for_profile(BrowserProfile::Mobile);
        assert!(cfg.headless);
        assert_eq!((cfg.viewport_width, cfg.viewport_height), (375, 812));
        assert_eq!(cfg.timeout_ms, 30_000);
        assert_eq!(cfg.screenshot_dir, "screenshots");
    }

    #[test]
    fn test_profile_keeps_unrelated_settings() {
        let mut cfg = BrowserConfig {
            locale: "de-DE".to_string(),
            viewport_width: 1440,
            ..BrowserConfig::default()
        };
        cfg.apply_profile(BrowserProfile::Test);
        assert_eq!(cfg.locale, "de-DE");
        assert_eq!(cfg.viewport_width, 1440);
        assert_eq!(cfg.timeout_ms, 15_000);
    }

    #[test]
    fn test_profile_from_str() {
        assert_eq!("Debug".parse::<BrowserProfile>().unwrap(), BrowserProfile::Debug);
        assert_eq!("prod".parse::<BrowserProfile>().unwrap(), BrowserProfile::Production);
        assert_eq!(BrowserProfile::Mobile.to_string(), "mobile");
        assert!("tablet".parse::<BrowserProfile>().is_err());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert!(cfg.browser.headless);
        assert_eq!(cfg.browser.viewport_width, 1920);
        assert_eq!(cfg.browser.viewport_height, 1080);
        assert_eq!(cfg.browser.timeout_ms, 30_000);
        assert!(cfg.browser.enforce_allow_list);
        assert_eq!(cfg.runner.navigation_attempts, 3);
        assert_eq!(cfg.llm.llm_max_retries, 3);
        assert_eq!(cfg.storage.snapshot_format, SnapshotFormat::Json);
    }

    #[test]
    fn test_camel_case_keys() {
        let raw = r#"{
  "browser": { "headless": false, "viewportWidth": 1280, "enforceAllowList": false, "slowHosts": [] },
  "storage": { "snapshotFormat": "jsonl" },
  "network": { "proxy": "http://127.0.0.1:7890", "noProxy": ["localhost"] }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(!cfg.browser.headless);
        assert_eq!(cfg.browser.viewport_width, 1280);
        assert_eq!(cfg.browser.viewport_height, 1080);
        assert!(!cfg.browser.enforce_allow_list);
        assert!(cfg.browser.slow_hosts.is_empty());
        assert_eq!(cfg.storage.snapshot_format, SnapshotFormat::Jsonl);
        assert_eq!(cfg.network.no_proxy, vec!["localhost".to_string()]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.llm.model = "claude-3-5-sonnet".to_string();
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.llm.model, "claude-3-5-sonnet");
        assert!(loaded.providers.contains_key("openrouter"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let cfg = Config::load_or_default(&paths).unwrap();
        assert_eq!(cfg.browser.locale, "en-US");
    }

    #[test]
    fn test_slow_host_matching() {
        let browser = BrowserConfig::default();
        assert!(browser.is_slow_host("google.com"));
        assert!(browser.is_slow_host("www.google.com"));
        assert!(!browser.is_slow_host("notgoogle.com"));
        assert!(!browser.is_slow_host("example.com"));
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let browser = BrowserConfig {
            screenshot_dir: dir.path().join("shots").to_string_lossy().to_string(),
            trace_dir: dir.path().join("traces").to_string_lossy().to_string(),
            ..BrowserConfig::default()
        };
        browser.ensure_dirs().unwrap();
        assert!(dir.path().join("shots").is_dir());
        assert!(dir.path().join("traces").is_dir());
    }
}
