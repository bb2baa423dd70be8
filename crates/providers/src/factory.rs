use stepwise_core::config::ProviderConfig;
use stepwise_core::Config;

use crate::client::Endpoint;
use crate::{AnthropicProvider, OpenAIProvider, Provider, Sampling};

struct KnownProvider {
    name: &'static str,
    /// Model string prefixes that select this provider.
    prefixes: &'static [&'static str],
    api_base: &'static str,
}

/// In fallback priority order.
const KNOWN: &[KnownProvider] = &[
    KnownProvider {
        name: "anthropic",
        prefixes: &["anthropic/", "claude-"],
        api_base: "https://api.anthropic.com/v1",
    },
    KnownProvider {
        name: "openai",
        prefixes: &["openai/", "gpt-", "o1", "o3"],
        api_base: "https://api.openai.com/v1",
    },
    KnownProvider {
        name: "openrouter",
        prefixes: &[],
        api_base: "https://openrouter.ai/api/v1",
    },
    KnownProvider {
        name: "deepseek",
        prefixes: &["deepseek"],
        api_base: "https://api.deepseek.com/v1",
    },
    KnownProvider {
        name: "groq",
        prefixes: &["groq/"],
        api_base: "https://api.groq.com/openai/v1",
    },
];

pub fn infer_provider_from_model(model: &str) -> Option<&'static str> {
    KNOWN
        .iter()
        .find(|k| k.prefixes.iter().any(|p| model.starts_with(p)))
        .map(|k| k.name)
}

fn has_key(config: &Config, name: &str) -> bool {
    config.providers.get(name).map_or(false, |p| !p.api_key.is_empty())
}

/// Explicit provider, then model prefix, then the first known provider with a
/// key. An explicit provider must be configured with a key.
fn resolve_name<'a>(config: &'a Config, model: &str, explicit: Option<&'a str>) -> anyhow::Result<&'a str> {
    if let Some(name) = explicit {
        if !config.providers.contains_key(name) {
            anyhow::bail!("Provider '{}' is set in llm.provider but has no providers entry", name);
        }
        if !has_key(config, name) {
            anyhow::bail!("Provider '{}' is set in llm.provider but has no API key", name);
        }
        return Ok(name);
    }
    if let Some(name) = infer_provider_from_model(model) {
        return Ok(name);
    }
    KNOWN
        .iter()
        .map(|k| k.name)
        .find(|name| has_key(config, name))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No LLM provider configured. Set llm.provider, use a recognised model prefix \
                 (claude-..., gpt-...), or add an API key under providers."
            )
        })
}

pub fn create_provider(config: &Config, model: &str, explicit: Option<&str>) -> anyhow::Result<Box<dyn Provider>> {
    let name = resolve_name(config, model, explicit)?;
    let default_base = KNOWN
        .iter()
        .find(|k| k.name == name)
        .map_or("https://api.openai.com/v1", |k| k.api_base);
    let empty = ProviderConfig::default();
    let section = config.providers.get(name).unwrap_or(&empty);
    let sampling = Sampling::from(&config.llm);

    let provider: Box<dyn Provider> = if name == "anthropic" {
        let endpoint = Endpoint::from_config("anthropic", config, section, default_base, model);
        Box::new(AnthropicProvider::new(endpoint, sampling))
    } else {
        let endpoint = Endpoint::from_config("openai-compatible", config, section, default_base, model);
        Box::new(OpenAIProvider::new(endpoint, sampling))
    };
    Ok(provider)
}

/// Backend for the step translator and instruction generator.
pub fn create_llm_provider(config: &Config) -> anyhow::Result<Box<dyn Provider>> {
    create_provider(config, &config.llm.model, config.llm.provider.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key(name: &str) -> Config {
        let mut config = Config::default();
        config.providers.entry(name.to_string()).or_default().api_key = "key".to_string();
        config
    }

    #[test]
    fn test_infer_provider_from_model() {
        assert_eq!(infer_provider_from_model("anthropic/claude-sonnet-4"), Some("anthropic"));
        assert_eq!(infer_provider_from_model("claude-3-5-sonnet"), Some("anthropic"));
        assert_eq!(infer_provider_from_model("gpt-4o"), Some("openai"));
        assert_eq!(infer_provider_from_model("deepseek-chat"), Some("deepseek"));
        assert_eq!(infer_provider_from_model("some-unknown-model"), None);
    }

    #[test]
    fn test_explicit_provider_wins() {
        let config = with_key("openai");
        assert_eq!(resolve_name(&config, "claude-3-opus", Some("openai")).unwrap(), "openai");
    }

    #[test]
    fn test_explicit_provider_needs_key() {
        let err = resolve_name(&Config::default(), "gpt-4o", Some("anthropic")).unwrap_err();
        assert!(err.to_string().contains("no API key"));
        assert!(resolve_name(&Config::default(), "gpt-4o", Some("nope")).is_err());
    }

    #[test]
    fn test_fallback_follows_priority() {
        let mut config = with_key("groq");
        config.providers.entry("openrouter".to_string()).or_default().api_key = "or".to_string();
        assert_eq!(resolve_name(&config, "mistral-large", None).unwrap(), "openrouter");
    }

    #[test]
    fn test_no_provider_is_an_error() {
        assert!(create_provider(&Config::default(), "some-unknown-model", None).is_err());
    }

    #[test]
    fn test_create_llm_provider_uses_llm_section() {
        let mut config = with_key("openrouter");
        config.llm.model = "mistral-large".to_string();
        assert!(create_llm_provider(&config).is_ok());
    }
}
