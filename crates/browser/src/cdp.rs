//! Chrome DevTools Protocol client over a page-target WebSocket.
//!
//! One writer task owns the sink; one reader task routes command responses to
//! their waiting callers by id and fans events out to subscribers.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::{Error, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 1024;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type ListenerMap = Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>>;

pub struct CdpClient {
    outgoing: mpsc::Sender<String>,
    pending: PendingMap,
    listeners: ListenerMap,
    next_id: AtomicU64,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| Error::Session(format!("Failed to connect to CDP endpoint {}: {}", ws_url, e)))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    error!(error = %e, "CDP write failed");
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_listeners = listeners.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => {
                        debug!("CDP socket closed by browser");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "CDP read failed");
                        break;
                    }
                };
                let Ok(message) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };

                if let Some(id) = message.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = reader_pending.lock().await.remove(&id) {
                        let _ = tx.send(message);
                    }
                } else if let Some(method) = message.get("method").and_then(Value::as_str) {
                    let listeners = reader_listeners.lock().await;
                    if let Some(subscribers) = listeners.get(method) {
                        let params = message.get("params").cloned().unwrap_or(Value::Null);
                        for tx in subscribers {
                            let _ = tx.try_send(params.clone());
                        }
                    }
                }
            }
        });

        Ok(Self {
            outgoing,
            pending,
            listeners,
            next_id: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    /// Sends `method` and waits for its `result`. Protocol errors become
    /// `Error::Command`; a missing reply becomes `Error::Timeout`.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({"id": id, "method": method, "params": params});
        if let Err(e) = self.outgoing.send(frame.to_string()).await {
            self.pending.lock().await.remove(&id);
            return Err(Error::Session(format!("CDP connection lost: {}", e)));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(reply)) => match reply.get("error") {
                Some(err) => Err(Error::Command(format!("CDP {} failed: {}", method, err))),
                None => Ok(reply.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(Error::Session(format!("CDP connection closed during {}", method))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!(
                    "CDP {} got no reply within {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Receiver for the params of every `method` event from now on.
    pub async fn subscribe(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<Value> {
        self.send("Page.navigate", json!({"url": url})).await
    }

    /// Evaluates `expression` and returns its JSON value. A thrown exception
    /// is an `Error::Command`.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let reply = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = reply.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("script threw");
            return Err(Error::Command(format!("Page script failed: {}", text)));
        }
        Ok(reply.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    pub async fn current_url(&self) -> Result<String> {
        let history = self.send("Page.getNavigationHistory", json!({})).await?;
        let index = history.get("currentIndex").and_then(Value::as_u64).unwrap_or(0) as usize;
        Ok(history
            .get("entries")
            .and_then(Value::as_array)
            .and_then(|entries| entries.get(index))
            .and_then(|entry| entry.get("url"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Base64 PNG. `full_page` clips to the whole document instead of the viewport.
    pub async fn screenshot(&self, full_page: bool) -> Result<String> {
        let mut params = json!({"format": "png"});
        if full_page {
            let metrics = self.send("Page.getLayoutMetrics", json!({})).await?;
            let size = metrics
                .get("cssContentSize")
                .or_else(|| metrics.get("contentSize"))
                .cloned()
                .unwrap_or(Value::Null);
            let width = size.get("width").and_then(Value::as_f64).unwrap_or(0.0);
            let height = size.get("height").and_then(Value::as_f64).unwrap_or(0.0);
            if width > 0.0 && height > 0.0 {
                params["clip"] = json!({"x": 0, "y": 0, "width": width, "height": height, "scale": 1});
            }
            params["captureBeyondViewport"] = json!(true);
        }
        let reply = self.send("Page.captureScreenshot", params).await?;
        reply
            .get("data")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Screenshot("no image data returned".to_string()))
    }

    pub async fn mouse_event(&self, kind: &str, x: f64, y: f64, click_count: u32) -> Result<()> {
        self.send(
            "Input.dispatchMouseEvent",
            json!({
                "type": kind,
                "x": x,
                "y": y,
                "button": if kind == "mouseMoved" { "none" } else { "left" },
                "clickCount": click_count,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn key_event(&self, kind: &str, key: &KeySpec) -> Result<()> {
        let mut params = json!({
            "type": kind,
            "key": key.key,
            "code": key.code,
            "windowsVirtualKeyCode": key.key_code,
        });
        if key.modifiers != 0 {
            params["modifiers"] = json!(key.modifiers);
        }
        if kind == "keyDown" {
            if let Some(text) = &key.text {
                params["text"] = json!(text);
            }
        }
        self.send("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    pub async fn insert_text(&self, text: &str) -> Result<()> {
        self.send("Input.insertText", json!({"text": text})).await?;
        Ok(())
    }

    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.send(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_user_agent(&self, user_agent: &str, accept_language: &str) -> Result<()> {
        self.send(
            "Emulation.setUserAgentOverride",
            json!({"userAgent": user_agent, "acceptLanguage": accept_language}),
        )
        .await?;
        Ok(())
    }

    pub async fn set_locale(&self, locale: &str) -> Result<()> {
        self.send("Emulation.setLocaleOverride", json!({"locale": locale})).await?;
        Ok(())
    }

    pub async fn set_timezone(&self, timezone: &str) -> Result<()> {
        self.send("Emulation.setTimezoneOverride", json!({"timezoneId": timezone}))
            .await?;
        Ok(())
    }

    pub async fn ignore_certificate_errors(&self) -> Result<()> {
        self.send("Security.setIgnoreCertificateErrors", json!({"ignore": true}))
            .await?;
        Ok(())
    }

    pub async fn close_browser(&self) -> Result<()> {
        self.send("Browser.close", json!({})).await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// One key as `Input.dispatchKeyEvent` wants it.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySpec {
    pub key: String,
    pub code: String,
    pub key_code: u32,
    /// Alt=1, Ctrl=2, Meta=4, Shift=8.
    pub modifiers: i32,
    /// Text inserted on keyDown, if the key produces any.
    pub text: Option<String>,
}

/// Parses `"Enter"`, `"a"`, `"Control+A"`, `"Shift+Tab"` and similar.
pub fn parse_key_spec(spec: &str) -> KeySpec {
    let parts: Vec<&str> = spec.split('+').collect();
    let (main, modifier_parts) = match parts.split_last() {
        Some((last, rest)) if !last.is_empty() => (*last, rest),
        // "Control++" and a bare "+"
        _ => ("+", &parts[..parts.len().saturating_sub(2)]),
    };

    let mut modifiers = 0;
    for part in modifier_parts {
        match part.to_ascii_lowercase().as_str() {
            "alt" | "option" => modifiers |= 1,
            "ctrl" | "control" => modifiers |= 2,
            "meta" | "cmd" | "command" => modifiers |= 4,
            "shift" => modifiers |= 8,
            _ => {}
        }
    }

    let named = |key: &str, code: &str, key_code: u32, text: Option<&str>| KeySpec {
        key: key.to_string(),
        code: code.to_string(),
        key_code,
        modifiers,
        text: text.map(str::to_string),
    };

    match main {
        "Enter" | "Return" => named("Enter", "Enter", 13, Some("\r")),
        "Tab" => named("Tab", "Tab", 9, None),
        "Escape" | "Esc" => named("Escape", "Escape", 27, None),
        "Backspace" => named("Backspace", "Backspace", 8, None),
        "Delete" => named("Delete", "Delete", 46, None),
        "ArrowUp" | "Up" => named("ArrowUp", "ArrowUp", 38, None),
        "ArrowDown" | "Down" => named("ArrowDown", "ArrowDown", 40, None),
        "ArrowLeft" | "Left" => named("ArrowLeft", "ArrowLeft", 37, None),
        "ArrowRight" | "Right" => named("ArrowRight", "ArrowRight", 39, None),
        "Home" => named("Home", "Home", 36, None),
        "End" => named("End", "End", 35, None),
        "PageUp" => named("PageUp", "PageUp", 33, None),
        "PageDown" => named("PageDown", "PageDown", 34, None),
        "Space" | " " => named(" ", "Space", 32, Some(" ")),
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => {
                    let upper = c.to_ascii_uppercase();
                    let code = if c.is_ascii_alphabetic() {
                        format!("Key{}", upper)
                    } else if c.is_ascii_digit() {
                        format!("Digit{}", c)
                    } else {
                        String::new()
                    };
                    // Chords with Ctrl/Alt/Meta fire shortcuts, not text.
                    let text = if modifiers & 0b111 == 0 { Some(c.to_string()) } else { None };
                    KeySpec {
                        key: c.to_string(),
                        code,
                        key_code: if c.is_ascii_alphanumeric() { upper as u32 } else { 0 },
                        modifiers,
                        text,
                    }
                }
                _ => named(other, other, 0, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_keys() {
        let enter = parse_key_spec("Enter");
        assert_eq!(enter.key_code, 13);
        assert_eq!(enter.text.as_deref(), Some("\r"));

        let tab = parse_key_spec("Shift+Tab");
        assert_eq!(tab.key, "Tab");
        assert_eq!(tab.modifiers, 8);
        assert!(tab.text.is_none());
    }

    #[test]
    fn test_parse_character_keys() {
        let a = parse_key_spec("a");
        assert_eq!(a.code, "KeyA");
        assert_eq!(a.key_code, 65);
        assert_eq!(a.text.as_deref(), Some("a"));

        let select_all = parse_key_spec("Control+a");
        assert_eq!(select_all.modifiers, 2);
        assert!(select_all.text.is_none());

        assert_eq!(parse_key_spec("7").code, "Digit7");
    }

    #[test]
    fn test_parse_plus_key() {
        assert_eq!(parse_key_spec("+").key, "+");
        let chord = parse_key_spec("Shift++");
        assert_eq!(chord.key, "+");
        assert_eq!(chord.modifiers, 8);
    }
}
