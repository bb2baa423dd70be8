//! Local Chrome/Chromium behind the `PageDriver` seam.
//!
//! Each launch gets its own process, debugging port and throwaway profile
//! directory, so sessions share no cookies or storage.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepwise_core::config::BrowserConfig;
use stepwise_core::{Error, Paths, Result};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::cdp::{parse_key_spec, CdpClient};
use crate::driver::{BrowserLauncher, LoadState, PageDriver};
use crate::locator::{ElementAction, Locator};

const LOCATOR_SCRIPT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/scripts/locator.js"));

const CDP_READY_TIMEOUT: Duration = Duration::from_secs(15);
const POLL: Duration = Duration::from_millis(100);

pub struct ChromeLauncher {
    paths: Paths,
}

impl ChromeLauncher {
    pub fn new() -> Self {
        Self { paths: Paths::new() }
    }

    pub fn with_paths(paths: Paths) -> Self {
        Self { paths }
    }
}

impl Default for ChromeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, config: &BrowserConfig) -> Result<Box<dyn PageDriver>> {
        let binary = match config.chrome_path.as_deref() {
            Some(path) if !path.trim().is_empty() => path.to_string(),
            _ => find_chrome_binary().ok_or_else(|| {
                Error::Session("Chrome/Chromium not found. Install it or set browser.chromePath".to_string())
            })?,
        };

        let profile_dir = self
            .paths
            .browser_profiles_dir()
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&profile_dir)?;

        let port = match find_free_port().await {
            Ok(p) => p,
            Err(e) => {
                remove_profile(&profile_dir);
                return Err(e);
            }
        };
        let args = chrome_args(config, port, &profile_dir);

        info!(binary = %binary, port, headless = config.headless, "Launching Chrome");

        let mut child = match Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                remove_profile(&profile_dir);
                return Err(Error::Session(format!("Failed to launch {}: {}", binary, e)));
            }
        };

        match connect_page(port, config).await {
            Ok((cdp, network)) => Ok(Box::new(ChromePage {
                cdp,
                network,
                idle_window: Duration::from_millis(config.network_idle_ms),
                child: tokio::sync::Mutex::new(Some(child)),
                profile_dir,
            })),
            Err(e) => {
                let _ = child.kill().await;
                remove_profile(&profile_dir);
                Err(e)
            }
        }
    }
}

async fn connect_page(port: u16, config: &BrowserConfig) -> Result<(CdpClient, NetworkTracker)> {
    wait_for_cdp_ready(port, CDP_READY_TIMEOUT).await?;
    let ws_url = get_page_ws_url(port).await?;
    let cdp = CdpClient::connect(&ws_url).await?;

    // Subscribe before Network.enable so no request is missed.
    let network = NetworkTracker::attach(&cdp).await;

    cdp.enable_domain("Page").await?;
    cdp.enable_domain("Runtime").await?;
    cdp.enable_domain("Network").await?;
    cdp.set_viewport(config.viewport_width, config.viewport_height).await?;
    cdp.set_user_agent(&config.user_agent, &config.locale).await?;

    if let Err(e) = cdp.set_locale(&config.locale).await {
        warn!(locale = %config.locale, error = %e, "Locale override not applied");
    }
    if let Err(e) = cdp.set_timezone(&config.timezone).await {
        warn!(timezone = %config.timezone, error = %e, "Timezone override not applied");
    }
    if let Err(e) = cdp.ignore_certificate_errors().await {
        warn!(error = %e, "Could not disable certificate checks");
    }

    info!(ws_url = %ws_url, "CDP connected to page target");
    Ok((cdp, network))
}

fn chrome_args(config: &BrowserConfig, port: u16, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", port),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
        format!("--lang={}", config.locale),
        format!("--window-size={},{}", config.viewport_width, config.viewport_height),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    args.push("about:blank".to_string());
    args
}

/// First Chrome/Chromium found at a well-known path or on `PATH`.
pub fn find_chrome_binary() -> Option<String> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    };

    candidates.iter().find_map(|candidate| {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        let bare = !candidate.contains('/') && !candidate.contains('\\');
        if bare && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
        None
    })
}

async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// Polls `/json/version` until Chrome answers.
async fn wait_for_cdp_ready(port: u16, timeout: Duration) -> Result<()> {
    let url = format!("http://127.0.0.1:{}/json/version", port);
    let started = Instant::now();
    loop {
        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if body.get("webSocketDebuggerUrl").is_some() {
                    return Ok(());
                }
            }
        }
        if started.elapsed() > timeout {
            return Err(Error::Session(format!(
                "Chrome debugging endpoint not ready after {}s on port {}",
                timeout.as_secs(),
                port
            )));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// WebSocket URL of the first `page` target; it can lag behind the browser endpoint.
async fn get_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);
    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let targets: Vec<Value> = match reqwest::get(&url).await {
            Ok(resp) => match resp.json().await {
                Ok(t) => t,
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        let ws = targets
            .iter()
            .filter(|t| t.get("type").and_then(Value::as_str) == Some("page"))
            .find_map(|t| t.get("webSocketDebuggerUrl").and_then(Value::as_str));
        if let Some(ws) = ws {
            return Ok(ws.to_string());
        }
    }
    Err(Error::Session("No page target found".to_string()))
}

fn remove_profile(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        debug!(dir = %dir.display(), error = %e, "Could not remove browser profile");
    }
}

// ─── Network activity ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct NetworkState {
    inflight: HashSet<String>,
    /// Finished before their start event was seen; listeners run on separate channels.
    finished_early: HashSet<String>,
    last_activity: Option<Instant>,
}

/// In-flight request bookkeeping fed by `Network.*` events.
#[derive(Debug, Clone, Default)]
struct NetworkTracker {
    state: Arc<std::sync::Mutex<NetworkState>>,
}

impl NetworkTracker {
    async fn attach(cdp: &CdpClient) -> Self {
        let tracker = Self::default();
        let started = cdp.subscribe("Network.requestWillBeSent").await;
        let finished = cdp.subscribe("Network.loadingFinished").await;
        let failed = cdp.subscribe("Network.loadingFailed").await;

        tokio::spawn(tracker.clone().follow(started, true));
        tokio::spawn(tracker.clone().follow(finished, false));
        tokio::spawn(tracker.clone().follow(failed, false));
        tracker
    }

    async fn follow(self, mut events: tokio::sync::mpsc::Receiver<Value>, is_start: bool) {
        while let Some(params) = events.recv().await {
            if let Some(id) = params.get("requestId").and_then(Value::as_str) {
                if is_start {
                    self.request_started(id);
                } else {
                    self.request_done(id);
                }
            }
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut NetworkState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn request_started(&self, id: &str) {
        self.with_state(|s| {
            if !s.finished_early.remove(id) {
                s.inflight.insert(id.to_string());
            }
            s.last_activity = Some(Instant::now());
        });
    }

    fn request_done(&self, id: &str) {
        self.with_state(|s| {
            if !s.inflight.remove(id) {
                s.finished_early.insert(id.to_string());
            }
            s.last_activity = Some(Instant::now());
        });
    }

    fn reset(&self) {
        self.with_state(|s| {
            s.inflight.clear();
            s.finished_early.clear();
            s.last_activity = Some(Instant::now());
        });
    }

    /// How long the network has been quiet; `None` while requests are open.
    fn quiet_for(&self) -> Option<Duration> {
        self.with_state(|s| {
            if !s.inflight.is_empty() {
                return None;
            }
            Some(s.last_activity.map(|t| t.elapsed()).unwrap_or(Duration::MAX))
        })
    }
}

// ─── Page ───────────────────────────────────────────────────────────

pub struct ChromePage {
    cdp: CdpClient,
    network: NetworkTracker,
    idle_window: Duration,
    child: tokio::sync::Mutex<Option<Child>>,
    profile_dir: PathBuf,
}

/// Outcome of one locator attempt that did not succeed.
enum Attempt {
    /// May succeed later (nothing matched yet, not visible yet).
    Retry(String),
    Fatal(Error),
}

impl From<Error> for Attempt {
    fn from(e: Error) -> Self {
        Attempt::Fatal(e)
    }
}

impl ChromePage {
    async fn ready_state(&self) -> String {
        match self.cdp.evaluate("document.readyState").await {
            Ok(Value::String(s)) => s,
            _ => String::new(),
        }
    }

    async fn reached(&self, state: LoadState) -> bool {
        let ready = self.ready_state().await;
        match state {
            LoadState::DomContentLoaded => ready == "interactive" || ready == "complete",
            LoadState::Load => ready == "complete",
            LoadState::NetworkIdle => {
                ready == "complete" && self.network.quiet_for().map_or(false, |q| q >= self.idle_window)
            }
        }
    }

    /// Runs one `locator.js` operation. `Err(Retry)` when the page script
    /// reports a condition that waiting may fix.
    async fn script(&self, locator: &Value, op: &str, arg: &Value) -> std::result::Result<Value, Attempt> {
        let expression = format!(
            "({})({}, {}, {})",
            LOCATOR_SCRIPT,
            locator,
            Value::String(op.to_string()),
            arg
        );
        let reply = self.cdp.evaluate(&expression).await?;
        if let Some(message) = reply.get("error").and_then(Value::as_str) {
            let fatal = reply.get("fatal").and_then(Value::as_bool).unwrap_or(false);
            return Err(if fatal {
                Attempt::Fatal(Error::Command(message.to_string()))
            } else {
                Attempt::Retry(message.to_string())
            });
        }
        Ok(reply.get("ok").cloned().unwrap_or(Value::Null))
    }

    async fn click_at(&self, point: &Value, click_count: u32) -> Result<()> {
        let x = point.get("x").and_then(Value::as_f64).unwrap_or(0.0);
        let y = point.get("y").and_then(Value::as_f64).unwrap_or(0.0);
        self.cdp.mouse_event("mouseMoved", x, y, 0).await?;
        for count in 1..=click_count {
            self.cdp.mouse_event("mousePressed", x, y, count).await?;
            self.cdp.mouse_event("mouseReleased", x, y, count).await?;
        }
        Ok(())
    }

    async fn attempt(&self, spec: &Value, action: &ElementAction) -> std::result::Result<Value, Attempt> {
        let none = Value::Null;
        match action {
            ElementAction::WaitFor(state) => {
                let probe = self.script(spec, "probe", &none).await?;
                let count = probe.get("count").and_then(Value::as_u64).unwrap_or(0);
                let visible = probe.get("visible").and_then(Value::as_bool).unwrap_or(false);
                if state.satisfied(count, visible) {
                    Ok(Value::Null)
                } else {
                    Err(Attempt::Retry(format!("{} matching element(s), visible: {}", count, visible)))
                }
            }
            ElementAction::IsVisible => {
                let probe = self.script(spec, "probe", &none).await?;
                let count = probe.get("count").and_then(Value::as_u64).unwrap_or(0);
                let visible = probe.get("visible").and_then(Value::as_bool).unwrap_or(false);
                Ok(Value::Bool(count > 0 && visible))
            }
            ElementAction::TextContent => self.script(spec, "text", &none).await,
            ElementAction::InputValue => self.script(spec, "value", &none).await,
            ElementAction::Click | ElementAction::Hover => {
                let point = self.script(spec, "point", &none).await?;
                if matches!(action, ElementAction::Click) {
                    self.click_at(&point, 1).await?;
                } else {
                    self.click_at(&point, 0).await?;
                }
                Ok(Value::Null)
            }
            ElementAction::DoubleClick => {
                let point = self.script(spec, "point", &none).await?;
                self.click_at(&point, 2).await?;
                Ok(Value::Null)
            }
            ElementAction::Fill(value) => {
                self.script(spec, "fill", &Value::String(value.clone())).await?;
                Ok(Value::Null)
            }
            ElementAction::Type(text) => {
                self.script(spec, "focus", &none).await?;
                self.keyboard_type(text).await?;
                Ok(Value::Null)
            }
            ElementAction::Press(key) => {
                self.script(spec, "focus", &none).await?;
                self.keyboard_press(key).await?;
                Ok(Value::Null)
            }
            ElementAction::Check => self.script(spec, "check", &none).await.map(|_| Value::Null),
            ElementAction::Uncheck => self.script(spec, "uncheck", &none).await.map(|_| Value::Null),
            ElementAction::SelectOption(values) => self.script(spec, "select", &json!(values)).await,
            ElementAction::Focus => self.script(spec, "focus", &none).await.map(|_| Value::Null),
        }
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn goto(&self, url: &str, wait_until: LoadState, timeout: Duration) -> Result<()> {
        self.network.reset();
        let reply = self
            .cdp
            .navigate(url)
            .await
            .map_err(|e| Error::Navigation(format!("Failed to navigate to {}: {}", url, e)))?;
        if let Some(reason) = reply.get("errorText").and_then(Value::as_str) {
            return Err(Error::Navigation(format!("Failed to navigate to {}: {}", url, reason)));
        }
        self.wait_for_load_state(wait_until, timeout)
            .await
            .map_err(|e| Error::Navigation(format!("Navigation to {} did not finish: {}", url, e)))
    }

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reached(state).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "waiting for '{}' exceeded {}ms",
                    state,
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(POLL).await;
        }
    }

    async fn url(&self) -> Result<String> {
        self.cdp.current_url().await
    }

    async fn content(&self) -> Result<String> {
        let html = self
            .cdp
            .evaluate(
                "(() => { const dt = document.doctype ? new XMLSerializer().serializeToString(document.doctype) : ''; \
                 return dt + (document.documentElement ? document.documentElement.outerHTML : ''); })()",
            )
            .await?;
        Ok(html.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>> {
        let data = self.cdp.screenshot(full_page).await?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::Screenshot(format!("invalid image data: {}", e)))
    }

    async fn element(&self, locator: &Locator, action: &ElementAction, timeout: Duration) -> Result<Value> {
        let spec = serde_json::to_value(locator)?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.attempt(&spec, action).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(reason)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Command(format!(
                            "{} on {} timed out after {}ms: {}",
                            action.name(),
                            locator,
                            timeout.as_millis(),
                            reason
                        )));
                    }
                }
            }
            tokio::time::sleep(POLL).await;
        }
    }

    async fn keyboard_press(&self, key: &str) -> Result<()> {
        let spec = parse_key_spec(key);
        self.cdp.key_event("keyDown", &spec).await?;
        self.cdp.key_event("keyUp", &spec).await
    }

    async fn keyboard_type(&self, text: &str) -> Result<()> {
        for c in text.chars() {
            if c == '\n' {
                self.keyboard_press("Enter").await?;
            } else if c.is_ascii() && !c.is_ascii_control() {
                let spec = parse_key_spec(&c.to_string());
                self.cdp.key_event("keyDown", &spec).await?;
                self.cdp.key_event("keyUp", &spec).await?;
            } else {
                self.cdp.insert_text(&c.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.cdp.close_browser().await {
            debug!(error = %e, "Browser.close failed, killing process");
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        remove_profile(&self.profile_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrome_args_follow_config() {
        let config = BrowserConfig {
            headless: false,
            viewport_width: 1280,
            viewport_height: 720,
            ..BrowserConfig::default()
        };
        let args = chrome_args(&config, 9333, Path::new("/tmp/profile"));
        assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--window-size=1280,720".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert_eq!(args.last().unwrap(), "about:blank");

        let headless = chrome_args(&BrowserConfig::default(), 1, Path::new("/p"));
        assert!(headless.contains(&"--headless=new".to_string()));
        assert!(headless.contains(&"--lang=en-US".to_string()));
    }

    #[test]
    fn test_network_tracker_counts_inflight() {
        let tracker = NetworkTracker::default();
        tracker.reset();
        tracker.request_started("1");
        tracker.request_started("2");
        assert!(tracker.quiet_for().is_none());
        tracker.request_done("1");
        assert!(tracker.quiet_for().is_none());
        tracker.request_done("2");
        assert!(tracker.quiet_for().is_some());
    }

    #[test]
    fn test_network_tracker_tolerates_out_of_order_events() {
        let tracker = NetworkTracker::default();
        tracker.request_done("7");
        tracker.request_started("7");
        assert!(tracker.quiet_for().is_some());
    }

    #[test]
    fn test_network_tracker_reset_clears_stale_requests() {
        let tracker = NetworkTracker::default();
        tracker.request_started("stuck");
        tracker.reset();
        let quiet = tracker.quiet_for().unwrap();
        assert!(quiet < Duration::from_secs(5));
    }

    #[test]
    fn test_locator_script_is_a_function_expression() {
        assert!(LOCATOR_SCRIPT.contains("(function (spec, op, arg)"));
        assert!(LOCATOR_SCRIPT.contains("strict mode violation"));
    }
}
