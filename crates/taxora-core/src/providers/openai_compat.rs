//! OpenAI-compatible providers (Grok, Perplexity)
//!
//! Reuses the OpenAI wire format with a different base URL, label and key prefix.

use async_trait::async_trait;
use std::time::Duration;

use super::descriptor::Availability;
use super::failure::BackendFailure;
use super::openai::OpenAiProvider;
use super::retry::RetryPolicy;
use super::types::{Backend, ChatMessage};

pub const GROK_BASE_URL: &str = "https://api.x.ai/v1";
pub const PERPLEXITY_BASE_URL: &str = "https://api.perplexity.ai";

/// OpenAI-compatible provider: wraps [`OpenAiProvider`] with a custom name
pub struct OpenAiCompatProvider {
    inner: OpenAiProvider,
    name: String,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .finish()
    }
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// - `name`: label used in logs (e.g. "grok", "perplexity")
    /// - `key_prefix`: expected credential prefix, empty to accept any key
    /// - `base_url`: the endpoint root (e.g. `https://api.x.ai/v1`)
    pub fn new(
        name: String,
        key_prefix: String,
        api_key: String,
        model: String,
        base_url: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            inner: OpenAiProvider::new(api_key, model, base_url, max_tokens)
                .with_name(name.clone())
                .with_key_prefix(key_prefix),
            name,
        }
    }

    /// xAI Grok
    pub fn grok(api_key: String, model: String, base_url: Option<String>, max_tokens: u32) -> Self {
        Self::new(
            "grok".to_string(),
            "xai-".to_string(),
            api_key,
            model,
            base_url.unwrap_or_else(|| GROK_BASE_URL.to_string()),
            max_tokens,
        )
    }

    /// Perplexity online models
    pub fn perplexity(
        api_key: String,
        model: String,
        base_url: Option<String>,
        max_tokens: u32,
    ) -> Self {
        Self::new(
            "perplexity".to_string(),
            "pplx-".to_string(),
            api_key,
            model,
            base_url.unwrap_or_else(|| PERPLEXITY_BASE_URL.to_string()),
            max_tokens,
        )
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.inner = self.inner.with_retry_policy(retry);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.inner = self.inner.with_temperature(temperature);
        self
    }
}

#[async_trait]
impl Backend for OpenAiCompatProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn probe(&self) -> (Availability, Option<String>) {
        self.inner.probe()
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        self.inner.generate(messages, timeout).await
    }
}
