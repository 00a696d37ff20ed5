//! Anthropic Claude provider

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
use super::types::{Backend, ChatMessage, ChatRole, split_system};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Claude provider
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, base_url: String, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_tokens,
            temperature: 0.7,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Convert provider-agnostic messages to Anthropic wire format.
    ///
    /// System turns move to the top-level `system` field.
    fn to_anthropic_request(&self, messages: &[ChatMessage]) -> AnthropicRequest {
        let (system, turns) = split_system(messages);
        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system,
            messages: turns
                .into_iter()
                .map(|m| AnthropicMessage {
                    role: match m.role {
                        ChatRole::Assistant => "assistant",
                        _ => "user",
                    }
                    .to_string(),
                    content: m.content.clone(),
                })
                .collect(),
        }
    }

    /// Join the text blocks of a Messages API response
    fn from_anthropic_response(resp: AnthropicApiResponse) -> Result<String, BackendFailure> {
        let text = resp
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(BackendFailure::malformed(format!(
                "Claude returned no text (stop reason {})",
                resp.stop_reason.as_deref().unwrap_or("unknown")
            )));
        }

        if let Some(usage) = resp.usage {
            debug!(
                "Anthropic usage: input={}, output={}",
                usage.input_tokens, usage.output_tokens
            );
        }
        Ok(text)
    }
}

/// Anthropic errors look like `{"type": "error", "error": {"type", "message"}}`
fn detect_anthropic_error(
    _status: StatusCode,
    headers: &HeaderMap,
    body: &Value,
) -> Option<BackendFailure> {
    let error = body.get("error")?;
    let kind = error.get("type").and_then(Value::as_str).unwrap_or("");
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");

    match kind {
        "rate_limit_error" => Some(BackendFailure::rate_limited(
            message,
            parse_retry_after(headers),
        )),
        "overloaded_error" | "api_error" => {
            Some(BackendFailure::transient(message).with_retry_after(parse_retry_after(headers)))
        }
        "authentication_error" | "permission_error" => Some(BackendFailure::auth(message)),
        _ => None,
    }
}

#[async_trait]
impl Backend for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn probe(&self) -> (Availability, Option<String>) {
        probe_credential(&self.api_key, "sk-ant-")
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.to_anthropic_request(messages);

        debug!(
            "Anthropic request: model={}, messages={}",
            self.model,
            body.messages.len()
        );

        let value = with_retries(&self.retry, "anthropic", |_| {
            let request = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body);
            exchange(request, timeout, detect_anthropic_error)
        })
        .await?;

        let api_response: AnthropicApiResponse = serde_json::from_value(value)
            .map_err(|e| BackendFailure::malformed(format!("unexpected response shape: {}", e)))?;

        Self::from_anthropic_response(api_response)
    }
}

// ── Anthropic wire types ──

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicApiResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}
