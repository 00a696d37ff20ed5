//! Local model runtime via the Ollama chat API
//!
//! No credential is involved. Availability only reflects whether the local
//! backend is enabled in configuration; a stopped runtime shows up as a
//! transient failure on dispatch.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::descriptor::Availability;
use super::failure::BackendFailure;
use super::http::exchange;
use super::quality;
use super::retry::{RetryPolicy, with_retries};
use super::types::{Backend, ChatMessage, last_user_message};

pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Local model served by Ollama
pub struct LocalProvider {
    client: Client,
    enabled: bool,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProvider")
            .field("client", &"<reqwest::Client>")
            .field("enabled", &self.enabled)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl LocalProvider {
    pub fn new(base_url: String, model: String, enabled: bool) -> Self {
        Self {
            client: Client::new(),
            enabled,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_tokens: 512,
            temperature: 0.7,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
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

    /// The model's reply with role echoes stripped, before the quality gate
    async fn fetch_reply(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        debug!(
            "Ollama request: model={}, messages={}",
            self.model,
            body.messages.len()
        );

        let value = with_retries(&self.retry, "ollama", |_| {
            let request = self.client.post(&url).json(&body);
            exchange(request, timeout, detect_ollama_error)
        })
        .await?;

        let response: OllamaResponse = serde_json::from_value(value)
            .map_err(|e| BackendFailure::malformed(format!("unexpected response shape: {}", e)))?;

        let raw = response.message.map(|m| m.content).unwrap_or_default();
        let cleaned = quality::clean_response(&raw);
        if cleaned.is_empty() {
            return Err(BackendFailure::malformed("local model returned no content"));
        }
        Ok(cleaned)
    }
}

/// Ollama answers errors with `{"error": "..."}`
fn detect_ollama_error(
    _status: StatusCode,
    _headers: &HeaderMap,
    body: &Value,
) -> Option<BackendFailure> {
    let message = body.get("error").and_then(Value::as_str)?;
    if message.contains("not found") {
        // A missing model will not fix itself on retry
        Some(BackendFailure::malformed(format!(
            "{} (pull the model first)",
            message
        )))
    } else {
        Some(BackendFailure::transient(message))
    }
}

#[async_trait]
impl Backend for LocalProvider {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn probe(&self) -> (Availability, Option<String>) {
        if self.enabled {
            (Availability::Available, None)
        } else {
            (
                Availability::NotConfigured,
                Some("local model runtime disabled".to_string()),
            )
        }
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

// ── Ollama wire types ──

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: Option<OllamaMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::failure::FailureKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: String) -> LocalProvider {
        LocalProvider::new(base_url, "granite3.3:2b".to_string(), true)
            .with_retry_policy(RetryPolicy::none())
    }

    #[test]
    fn test_probe_follows_enabled_flag() {
        assert_eq!(provider(String::new()).probe().0, Availability::Available);
        let disabled = LocalProvider::new(String::new(), "m".to_string(), false);
        let (availability, detail) = disabled.probe();
        assert_eq!(availability, Availability::NotConfigured);
        assert!(detail.is_some());
    }

    #[test]
    fn test_missing_model_is_not_retryable() {
        let body = serde_json::json!({"error": "model \"granite3.3:2b\" not found, try pulling it first"});
        let failure =
            detect_ollama_error(StatusCode::NOT_FOUND, &HeaderMap::new(), &body).unwrap();
        assert_eq!(failure.kind, FailureKind::Malformed);
        assert!(!failure.is_retryable());
    }

    #[tokio::test]
    async fn test_generate_non_streaming_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"stream": false, "model": "granite3.3:2b"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "granite3.3:2b",
                "message": {"role": "assistant", "content": "Track every expense for a month, then set a budget for each category."},
                "done": true
            })))
            .mount(&server)
            .await;

        let reply = provider(server.uri())
            .generate(&[ChatMessage::user("budget help")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            reply,
            "Track every expense for a month, then set a budget for each category."
        );
    }

    #[tokio::test]
    async fn test_preamble_only_reply_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "Assistant:\nUser:"},
                "done": true
            })))
            .mount(&server)
            .await;

        let failure = provider(server.uri())
            .generate(&[ChatMessage::user("How do I save?")], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Malformed);
    }

    #[tokio::test]
    async fn test_unreviewed_reply_skips_quality_gate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "Assistant: OK"},
                "done": true
            })))
            .mount(&server)
            .await;

        let local = provider(server.uri());
        let messages = [ChatMessage::user("Reply with OK")];
        let raw = local
            .generate_unreviewed(&messages, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(raw, "OK");
        let reviewed = local
            .generate(&messages, Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(reviewed, "OK");
    }

    #[tokio::test]
    async fn test_runtime_down_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let failure = provider(format!("http://{}", addr))
            .generate(&[ChatMessage::user("hi")], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transient);
    }
}
