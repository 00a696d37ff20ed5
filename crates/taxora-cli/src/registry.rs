//! Builds the provider router from config

use crate::config::{ApiProviderConfig, TaxoraConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taxora_core::providers::anthropic::ANTHROPIC_BASE_URL;
use taxora_core::providers::huggingface::HUGGINGFACE_BASE_URL;
use taxora_core::providers::openai::OPENAI_BASE_URL;
use taxora_core::providers::{
    AnthropicProvider, GeminiProvider, HuggingFaceProvider, LocalProvider, OpenAiCompatProvider,
    OpenAiProvider, RequestBudget,
};
use taxora_core::{Backend, BackendDescriptor, ProviderRouter, RouterConfig};
use tracing::{info, warn};

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_CHATGPT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_CLAUDE_MODEL: &str = "claude-3-haiku-20240307";
const DEFAULT_GROK_MODEL: &str = "grok-beta";
const DEFAULT_PERPLEXITY_MODEL: &str = "llama-3.1-sonar-small-128k-online";
const DEFAULT_HUGGINGFACE_MODEL: &str = "microsoft/DialoGPT-medium";

fn or_default(value: &str, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Routing settings from `[router]` and the per-backend `timeout_secs`
pub fn router_config(config: &TaxoraConfig) -> RouterConfig {
    let p = &config.providers;
    let timeouts = [
        ("gemini", p.gemini.timeout_secs),
        ("chatgpt", p.chatgpt.timeout_secs),
        ("claude", p.claude.timeout_secs),
        ("grok", p.grok.timeout_secs),
        ("perplexity", p.perplexity.timeout_secs),
        ("huggingface", p.huggingface.timeout_secs),
        ("local", p.local.timeout_secs),
    ];
    let request_timeouts: HashMap<String, Duration> = timeouts
        .into_iter()
        .filter_map(|(id, secs)| secs.map(|s| (id.to_string(), Duration::from_secs(s))))
        .collect();

    RouterConfig {
        default_backend: config.router.default_backend.clone(),
        switching_enabled: config.router.switching_enabled,
        fallback_backend: non_empty(&config.router.fallback_backend),
        fallback_overrides: config.router.fallback_overrides.clone(),
        request_timeouts,
        ..RouterConfig::default()
    }
}

/// Every backend the router knows about, with its descriptor
pub fn build_backends(config: &TaxoraConfig) -> Vec<(BackendDescriptor, Arc<dyn Backend>)> {
    let p = &config.providers;
    let retry = config.retry.policy();

    let gemini_budget = (p.gemini.requests_per_minute > 0 && p.gemini.requests_per_day > 0)
        .then(|| RequestBudget::new(p.gemini.requests_per_minute, p.gemini.requests_per_day));
    let mut gemini = GeminiProvider::new(
        p.gemini.api_key.clone(),
        or_default(&p.gemini.model, DEFAULT_GEMINI_MODEL),
        p.gemini.max_tokens,
    )
    .with_backup_key(non_empty(&p.gemini.backup_api_key))
    .with_temperature(p.gemini.temperature)
    .with_retry_policy(retry)
    .with_budget(gemini_budget);
    if let Some(base_url) = non_empty(&p.gemini.base_url) {
        gemini = gemini.with_base_url(base_url);
    }

    let chatgpt = OpenAiProvider::new(
        p.chatgpt.api_key.clone(),
        or_default(&p.chatgpt.model, DEFAULT_CHATGPT_MODEL),
        or_default(&p.chatgpt.base_url, OPENAI_BASE_URL),
        p.chatgpt.max_tokens,
    )
    .with_name("chatgpt")
    .with_temperature(p.chatgpt.temperature)
    .with_retry_policy(retry);

    let claude = AnthropicProvider::new(
        p.claude.api_key.clone(),
        or_default(&p.claude.model, DEFAULT_CLAUDE_MODEL),
        or_default(&p.claude.base_url, ANTHROPIC_BASE_URL),
        p.claude.max_tokens,
    )
    .with_temperature(p.claude.temperature)
    .with_retry_policy(retry);

    let grok = compat(&p.grok, DEFAULT_GROK_MODEL, OpenAiCompatProvider::grok)
        .with_retry_policy(retry);
    let perplexity = compat(
        &p.perplexity,
        DEFAULT_PERPLEXITY_MODEL,
        OpenAiCompatProvider::perplexity,
    )
    .with_retry_policy(retry);

    let huggingface = HuggingFaceProvider::new(
        p.huggingface.api_key.clone(),
        or_default(&p.huggingface.model, DEFAULT_HUGGINGFACE_MODEL),
        or_default(&p.huggingface.base_url, HUGGINGFACE_BASE_URL),
        p.huggingface.max_tokens,
    )
    .with_temperature(p.huggingface.temperature)
    .with_retry_policy(retry);

    let local = LocalProvider::new(p.local.base_url.clone(), p.local.model.clone(), p.local.enabled)
        .with_max_tokens(p.local.max_tokens)
        .with_temperature(p.local.temperature)
        .with_retry_policy(retry);

    vec![
        (
            BackendDescriptor::new("gemini", "Google Gemini")
                .with_description("Google's Gemini models with a generous free quota"),
            Arc::new(gemini) as Arc<dyn Backend>,
        ),
        (
            BackendDescriptor::new("chatgpt", "OpenAI ChatGPT")
                .with_description("OpenAI chat models"),
            Arc::new(chatgpt),
        ),
        (
            BackendDescriptor::new("claude", "Anthropic Claude")
                .with_description("Anthropic's Claude models"),
            Arc::new(claude),
        ),
        (
            BackendDescriptor::new("grok", "xAI Grok").with_description("xAI's Grok models"),
            Arc::new(grok),
        ),
        (
            BackendDescriptor::new("perplexity", "Perplexity")
                .with_description("Perplexity online models with web-grounded answers"),
            Arc::new(perplexity),
        ),
        (
            BackendDescriptor::new("huggingface", "Hugging Face")
                .with_description("Open models through the Hugging Face Inference API"),
            Arc::new(huggingface),
        ),
        (
            BackendDescriptor::new("local", "Local model")
                .with_description("Model served by a local Ollama runtime (free, offline)")
                .without_credential(),
            Arc::new(local),
        ),
    ]
}

fn compat(
    cfg: &ApiProviderConfig,
    default_model: &str,
    preset: fn(String, String, Option<String>, u32) -> OpenAiCompatProvider,
) -> OpenAiCompatProvider {
    preset(
        cfg.api_key.clone(),
        or_default(&cfg.model, default_model),
        non_empty(&cfg.base_url),
        cfg.max_tokens,
    )
    .with_temperature(cfg.temperature)
}

/// Probe every backend, register it, and return the ready router
pub async fn bootstrap(config: &TaxoraConfig) -> ProviderRouter {
    let router = ProviderRouter::new(router_config(config));

    for (descriptor, adapter) in build_backends(config) {
        let descriptor = descriptor.with_availability(adapter.probe());
        match &descriptor.detail {
            Some(detail) if !descriptor.is_available() => {
                info!("Backend {} is {}: {}", descriptor.id, descriptor.availability, detail)
            }
            _ => info!("Backend {} is {}", descriptor.id, descriptor.availability),
        }
        router.register(descriptor, adapter).await;
    }

    let status = router.list_status().await;
    let default_ready = status
        .backends
        .iter()
        .any(|b| b.descriptor.id == status.active_id && b.descriptor.is_available());
    if !default_ready {
        warn!(
            "Default backend '{}' is not available; requests will rely on fallback",
            status.active_id
        );
    }
    info!(
        "Provider router ready: {} of {} backends available, active: {}",
        status.available_count,
        status.backends.len(),
        status.active_id
    );

    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxora_core::Availability;

    fn config_from(toml_text: &str) -> TaxoraConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn test_router_config_timeouts() {
        let config = config_from(
            r#"
            [providers.gemini]
            timeout_secs = 30
            "#,
        );
        let rc = router_config(&config);
        assert_eq!(rc.request_timeouts["gemini"], Duration::from_secs(30));
        assert_eq!(rc.request_timeouts["local"], Duration::from_secs(90));
        assert!(!rc.request_timeouts.contains_key("chatgpt"));
        assert_eq!(rc.default_request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_router_config_empty_fallback_disables() {
        let config = config_from(
            r#"
            [router]
            default_backend = "claude"
            switching_enabled = false
            fallback_backend = ""
            "#,
        );
        let rc = router_config(&config);
        assert_eq!(rc.default_backend, "claude");
        assert!(!rc.switching_enabled);
        assert!(rc.fallback_backend.is_none());
    }

    #[test]
    fn test_build_backends_covers_every_id() {
        let backends = build_backends(&TaxoraConfig::default());
        let ids: Vec<&str> = backends.iter().map(|(d, _)| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["gemini", "chatgpt", "claude", "grok", "perplexity", "huggingface", "local"]
        );
        for (descriptor, adapter) in &backends {
            assert!(!adapter.model().is_empty(), "{} has no model", descriptor.id);
        }
    }

    #[tokio::test]
    async fn test_bootstrap_probes_credentials() {
        let config = config_from(
            r#"
            [providers.gemini]
            api_key = "AIzaTestKey123"

            [providers.chatgpt]
            api_key = "not-a-real-key"
            "#,
        );
        let router = bootstrap(&config).await;
        let status = router.list_status().await;
        let availability = |id: &str| {
            status
                .backends
                .iter()
                .find(|b| b.descriptor.id == id)
                .map(|b| b.descriptor.availability)
                .unwrap()
        };

        assert_eq!(status.backends.len(), 7);
        assert_eq!(status.active_id, "local");
        assert_eq!(availability("gemini"), Availability::Available);
        assert_eq!(availability("chatgpt"), Availability::Error);
        assert_eq!(availability("claude"), Availability::NotConfigured);
        assert_eq!(availability("local"), Availability::Available);
        assert_eq!(status.available_count, 2);
    }

    #[tokio::test]
    async fn test_bootstrap_disabled_local() {
        let config = config_from(
            r#"
            [providers.local]
            enabled = false
            "#,
        );
        let router = bootstrap(&config).await;
        let status = router.list_status().await;
        assert_eq!(status.available_count, 0);
    }
}
