use reqwest::{Client, Proxy};
use serde_json::Value;
use std::time::Duration;
use stepwise_core::config::ProviderConfig;
use stepwise_core::{Config, Error, Result};
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const PREVIEW_BYTES: usize = 500;

/// Where requests to one LLM endpoint are routed.
#[derive(Debug, PartialEq)]
enum Route {
    Proxy(String),
    /// `proxy = ""` on the provider, or the host is listed in `no_proxy`.
    Direct,
    /// Leave it to reqwest, which honours HTTPS_PROXY / HTTP_PROXY.
    Environment,
}

/// `no_proxy` entries: `host`, `*.domain` (subdomains only) or `.domain`
/// (the domain itself and its subdomains).
fn bypasses_proxy(host: &str, no_proxy: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    no_proxy.iter().map(|r| r.trim().to_ascii_lowercase()).any(|rule| {
        if rule.is_empty() {
            false
        } else if let Some(domain) = rule.strip_prefix("*.") {
            host.ends_with(&format!(".{}", domain))
        } else if let Some(domain) = rule.strip_prefix('.') {
            host == domain || host.ends_with(&format!(".{}", domain))
        } else {
            host == rule
        }
    })
}

fn endpoint_host(api_base: &str) -> Option<String> {
    let parsed = url::Url::parse(api_base).ok()?;
    parsed
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
}

fn route_for(provider_proxy: Option<&str>, global_proxy: Option<&str>, no_proxy: &[String], api_base: &str) -> Route {
    if let Some(p) = provider_proxy {
        return if p.is_empty() { Route::Direct } else { Route::Proxy(p.to_string()) };
    }
    match global_proxy.filter(|g| !g.is_empty()) {
        Some(global) => {
            let skip = endpoint_host(api_base).map_or(false, |h| bypasses_proxy(&h, no_proxy));
            if skip {
                Route::Direct
            } else {
                Route::Proxy(global.to_string())
            }
        }
        None => Route::Environment,
    }
}

/// HTTP client for one provider endpoint. The provider's own proxy setting
/// beats `network.proxy`, which in turn respects `network.noProxy`.
pub fn build_http_client(
    provider_proxy: Option<&str>,
    global_proxy: Option<&str>,
    no_proxy: &[String],
    api_base: &str,
    timeout: Duration,
) -> Client {
    let builder = Client::builder().timeout(timeout);
    let builder = match route_for(provider_proxy, global_proxy, no_proxy, api_base) {
        Route::Proxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, api_base = %api_base, "LLM requests go through proxy");
                builder.proxy(p)
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Ignoring invalid proxy URL");
                builder
            }
        },
        Route::Direct => builder.no_proxy(),
        Route::Environment => builder,
    };

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Falling back to a default HTTP client");
        Client::new()
    })
}

/// At most `max_bytes` of `s`, cut on a char boundary.
pub(crate) fn preview(s: &str, max_bytes: usize) -> &str {
    if max_bytes >= s.len() {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// One resolved LLM endpoint: who to call, with which key and model, over
/// which HTTP client.
pub struct Endpoint {
    label: &'static str,
    client: Client,
    pub(crate) api_key: String,
    pub(crate) api_base: String,
    pub(crate) model: String,
}

impl Endpoint {
    pub fn new(label: &'static str, api_key: &str, api_base: &str, model: &str, client: Client) -> Self {
        Self {
            label,
            client,
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    /// Endpoint for a named provider section, routed through the configured
    /// proxies.
    pub fn from_config(
        label: &'static str,
        config: &Config,
        provider: &ProviderConfig,
        default_base: &str,
        model: &str,
    ) -> Self {
        let api_base = provider.api_base.as_deref().unwrap_or(default_base);
        let client = build_http_client(
            provider.proxy.as_deref(),
            config.network.proxy.as_deref(),
            &config.network.no_proxy,
            api_base,
            REQUEST_TIMEOUT,
        );
        Self::new(label, &provider.api_key, api_base, model, client)
    }

    /// POSTs `body` to `<api_base>/<path>` and returns the raw success body.
    pub(crate) async fn post_json(&self, path: &str, headers: &[(&str, &str)], body: &Value) -> Result<String> {
        let url = format!("{}/{}", self.api_base, path);
        info!(provider = self.label, url = %url, model = %self.model, "Calling LLM");

        let mut request = self.client.post(&url).header("Content-Type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("{} request failed: {}", self.label, e)))?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!(provider = self.label, status = %status, body = %preview(&raw, PREVIEW_BYTES), "LLM API error");
            return Err(Error::Provider(format!("{} API error {}: {}", self.label, status, raw)));
        }
        debug!(provider = self.label, body_len = raw.len(), preview = %preview(&raw, PREVIEW_BYTES), "LLM raw response");
        Ok(raw)
    }

    pub(crate) fn parse<T: serde::de::DeserializeOwned>(&self, raw: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(|e| {
            Error::Provider(format!(
                "Failed to parse {} response: {}. Body: {}",
                self.label,
                e,
                preview(raw, PREVIEW_BYTES)
            ))
        })
    }
}
