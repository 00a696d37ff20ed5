//! OpenAI chat completions adapter (ChatGPT)

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::descriptor::{Availability, probe_credential};
use super::failure::{BackendFailure, parse_retry_after};
use super::http::exchange;
use super::retry::{RetryPolicy, with_retries};
use super::types::{Backend, ChatMessage};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI provider
pub struct OpenAiProvider {
    client: Client,
    name: String,
    api_key: String,
    key_prefix: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiProvider {
    /// `base_url` is the API root including the version segment
    /// (e.g. `https://api.openai.com/v1`).
    pub fn new(api_key: String, model: String, base_url: String, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            name: "openai".to_string(),
            api_key,
            key_prefix: "sk-".to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_tokens,
            temperature: 0.7,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Convert provider-agnostic messages to OpenAI wire format
    fn to_openai_messages(messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    /// Extract the reply text from a chat completion
    fn from_openai_response(resp: OpenAiApiResponse) -> Result<String, BackendFailure> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendFailure::malformed("response had no choices"))?;

        let text = choice.message.content.unwrap_or_default().trim().to_string();
        if text.is_empty() {
            return Err(BackendFailure::malformed("response had no text content"));
        }

        if let Some(usage) = resp.usage {
            debug!(
                "OpenAI usage: prompt={}, completion={}",
                usage.prompt_tokens, usage.completion_tokens
            );
        }
        Ok(text)
    }
}

/// Error bodies OpenAI-compatible APIs return alongside (or instead of) a status
fn detect_openai_error(
    _status: StatusCode,
    headers: &HeaderMap,
    body: &Value,
) -> Option<BackendFailure> {
    let error = body.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .or_else(|| error.get("type").and_then(Value::as_str))
        .unwrap_or("");
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");

    match code {
        "insufficient_quota" | "rate_limit_exceeded" => Some(BackendFailure::rate_limited(
            message,
            parse_retry_after(headers),
        )),
        "invalid_api_key" | "invalid_authentication" => Some(BackendFailure::auth(message)),
        _ => None,
    }
}

#[async_trait]
impl Backend for OpenAiProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn probe(&self) -> (Availability, Option<String>) {
        probe_credential(&self.api_key, &self.key_prefix)
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        let url = format!("{}/chat/completions", self.base_url);
        let openai_messages = Self::to_openai_messages(messages);

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": openai_messages,
        });

        debug!(
            "{} request: model={}, messages={}",
            self.name,
            self.model,
            openai_messages.len()
        );

        let value = with_retries(&self.retry, &self.name, |_| {
            let request = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body);
            exchange(request, timeout, detect_openai_error)
        })
        .await?;

        let api_response: OpenAiApiResponse = serde_json::from_value(value)
            .map_err(|e| BackendFailure::malformed(format!("unexpected response shape: {}", e)))?;

        Self::from_openai_response(api_response)
    }
}

// ── OpenAI wire types ──

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiApiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
