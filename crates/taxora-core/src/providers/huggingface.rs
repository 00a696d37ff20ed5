//! Hugging Face Inference API provider
//!
//! Text-generation models take a single flattened prompt rather than chat
//! turns, and small hosted models need the quality gate.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::descriptor::{Availability, probe_credential};
use super::failure::{BackendFailure, parse_retry_after};
use super::http::exchange;
use super::quality;
use super::retry::{RetryPolicy, with_retries};
use super::types::{Backend, ChatMessage, ChatRole, last_user_message};

pub const HUGGINGFACE_BASE_URL: &str = "https://api-inference.huggingface.co";

/// Hugging Face hosted inference provider
pub struct HuggingFaceProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_new_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HuggingFaceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HuggingFaceProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_new_tokens", &self.max_new_tokens)
            .finish()
    }
}

impl HuggingFaceProvider {
    pub fn new(api_key: String, model: String, base_url: String, max_new_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_new_tokens,
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

    /// Flatten the conversation into a role-labelled prompt ending with an open assistant turn
    fn build_prompt(messages: &[ChatMessage]) -> String {
        let mut prompt = String::new();
        for m in messages {
            let label = match m.role {
                ChatRole::System => "System",
                ChatRole::User => "Human",
                ChatRole::Assistant => "Assistant",
            };
            prompt.push_str(label);
            prompt.push_str(": ");
            prompt.push_str(m.content.trim());
            prompt.push('\n');
        }
        prompt.push_str("Assistant:");
        prompt
    }

    /// Pull `generated_text` out of either the list or the object response shape
    fn extract_generated_text(value: Value) -> Result<String, BackendFailure> {
        let outputs: Vec<HfGeneration> = match value {
            Value::Array(_) => serde_json::from_value(value),
            Value::Object(_) => serde_json::from_value(value).map(|one| vec![one]),
            other => {
                return Err(BackendFailure::malformed(format!(
                    "unexpected response type: {}",
                    other
                )));
            }
        }
        .map_err(|e| BackendFailure::malformed(format!("unexpected response shape: {}", e)))?;

        let text = outputs
            .into_iter()
            .next()
            .and_then(|o| o.generated_text)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(BackendFailure::malformed("model returned no generated text"));
        }
        Ok(text)
    }

    /// The generated text with role echoes stripped, before the quality gate
    async fn fetch_reply(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        let url = format!("{}/models/{}", self.base_url, self.model);
        let prompt = Self::build_prompt(messages);

        let body = serde_json::json!({
            "inputs": prompt,
            "parameters": {
                "max_new_tokens": self.max_new_tokens,
                "temperature": self.temperature,
                "top_p": 0.9,
                "repetition_penalty": 1.1,
                "do_sample": true,
                "return_full_text": false,
            },
            "options": {"wait_for_model": false},
        });

        debug!(
            "Hugging Face request: model={}, prompt_chars={}",
            self.model,
            prompt.len()
        );

        let value = with_retries(&self.retry, "huggingface", |_| {
            let request = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body);
            exchange(request, timeout, detect_huggingface_error)
        })
        .await?;

        let raw = Self::extract_generated_text(value)?;
        let cleaned = quality::clean_response(&raw);
        if cleaned.is_empty() {
            return Err(BackendFailure::malformed("model returned only role labels"));
        }
        Ok(cleaned)
    }
}

/// Errors arrive as `{"error": "...", "estimated_time": 20.0}` while a model loads
fn detect_huggingface_error(
    status: StatusCode,
    headers: &HeaderMap,
    body: &Value,
) -> Option<BackendFailure> {
    let message = body.get("error").and_then(Value::as_str)?;
    let lower = message.to_lowercase();

    if lower.contains("loading") {
        let estimated = body
            .get("estimated_time")
            .and_then(Value::as_f64)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);
        return Some(BackendFailure::transient(message).with_retry_after(estimated));
    }
    if lower.contains("rate limit") || status == StatusCode::TOO_MANY_REQUESTS {
        return Some(BackendFailure::rate_limited(
            message,
            parse_retry_after(headers),
        ));
    }
    if lower.contains("authorization") || lower.contains("invalid token") {
        return Some(BackendFailure::auth(message));
    }
    None
}

#[async_trait]
impl Backend for HuggingFaceProvider {
    fn provider_name(&self) -> &str {
        "huggingface"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn probe(&self) -> (Availability, Option<String>) {
        probe_credential(&self.api_key, "hf_")
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        let cleaned = self.fetch_reply(messages, timeout).await?;
        Ok(quality::review(&cleaned, last_user_message(messages)))
    }

    async fn generate_unreviewed(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        self.fetch_reply(messages, timeout).await
    }
}

// ── Hugging Face wire types ──

#[derive(Debug, Clone, Deserialize)]
struct HfGeneration {
    generated_text: Option<String>,
}
