//! Google Gemini provider
//!
//! Keeps a client-side request budget matching the free tier and switches to
//! a backup key once the primary key is rate limited upstream.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::descriptor::{Availability, probe_credential};
use super::failure::{BackendFailure, FailureKind, parse_retry_after};
use super::http::exchange;
use super::rate_limit::{BudgetExceeded, RateLimitStatus, RequestBudget};
use super::retry::{RetryPolicy, with_retries};
use super::types::{Backend, ChatMessage, ChatRole, split_system};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Free-tier defaults
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 50;
pub const DEFAULT_REQUESTS_PER_DAY: u32 = 1500;

/// Google Gemini provider
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    backup_key: Option<String>,
    using_backup: AtomicBool,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
    budget: Option<RequestBudget>,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("has_backup_key", &self.backup_key.is_some())
            .field("using_backup", &self.on_backup())
            .finish()
    }
}

impl GeminiProvider {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key,
            backup_key: None,
            using_backup: AtomicBool::new(false),
            base_url: GEMINI_BASE_URL.to_string(),
            model,
            max_tokens,
            temperature: 0.7,
            retry: RetryPolicy::default(),
            budget: Some(RequestBudget::new(
                DEFAULT_REQUESTS_PER_MINUTE,
                DEFAULT_REQUESTS_PER_DAY,
            )),
        }
    }

    /// Secondary key used once the primary is rate limited. Blank keys are ignored.
    pub fn with_backup_key(mut self, key: Option<String>) -> Self {
        self.backup_key = key.filter(|k| !k.trim().is_empty() && !k.contains("${"));
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
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

    /// Replace the request budget; `None` disables client-side limiting
    pub fn with_budget(mut self, budget: Option<RequestBudget>) -> Self {
        self.budget = budget;
        self
    }

    fn primary_usable(&self) -> bool {
        probe_credential(&self.api_key, "AIza").0 == Availability::Available
    }

    /// The backup key serves every request when the primary is missing or
    /// malformed, and after the primary has been rate limited.
    fn on_backup(&self) -> bool {
        self.backup_key.is_some()
            && (self.using_backup.load(Ordering::SeqCst) || !self.primary_usable())
    }

    fn current_key(&self) -> &str {
        match &self.backup_key {
            Some(backup) if self.on_backup() => backup,
            _ => &self.api_key,
        }
    }

    /// Switch to the backup key once. Returns false if there is none or it is already in use.
    fn switch_to_backup(&self) -> bool {
        if self.backup_key.is_none() || self.on_backup() {
            return false;
        }
        if self.using_backup.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!("Gemini primary key rate limited, switching to backup key");
        true
    }

    /// Convert provider-agnostic messages to Gemini wire format
    fn to_gemini_request(&self, messages: &[ChatMessage]) -> GeminiRequest {
        let (system, turns) = split_system(messages);
        let contents = turns
            .into_iter()
            .map(|m| GeminiContent {
                role: match m.role {
                    ChatRole::Assistant => "model",
                    _ => "user",
                }
                .to_string(),
                parts: vec![GeminiPart {
                    text: m.content.clone(),
                }],
            })
            .collect();

        GeminiRequest {
            contents,
            system_instruction: system.map(|text| GeminiSystemInstruction {
                parts: vec![GeminiPart { text }],
            }),
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
            },
        }
    }

    /// Extract the reply text from a generateContent response
    fn from_gemini_response(resp: GeminiApiResponse) -> Result<String, BackendFailure> {
        let Some(candidate) = resp.candidates.into_iter().next() else {
            let reason = resp
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(BackendFailure::malformed(format!(
                "Gemini returned no candidates ({})",
                reason
            )));
        };

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect::<Vec<_>>().join(""))
            .unwrap_or_default();
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(BackendFailure::malformed(format!(
                "Gemini candidate had no text (finish reason {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }

        if let Some(usage) = resp.usage_metadata {
            debug!(
                "Gemini usage: prompt={}, candidates={}",
                usage.prompt_token_count.unwrap_or(0),
                usage.candidates_token_count.unwrap_or(0)
            );
        }
        Ok(text)
    }

    async fn send(
        &self,
        url: &str,
        body: &GeminiRequest,
        timeout: Duration,
    ) -> Result<Value, BackendFailure> {
        with_retries(&self.retry, "gemini", |_| {
            let request = self
                .client
                .post(url)
                .header("x-goog-api-key", self.current_key())
                .json(body);
            exchange(request, timeout, detect_gemini_error)
        })
        .await
    }
}

/// Gemini reports errors as `{"error": {"code", "message", "status"}}`
fn detect_gemini_error(
    _status: StatusCode,
    headers: &HeaderMap,
    body: &Value,
) -> Option<BackendFailure> {
    let error = body.get("error")?;
    let status = error.get("status").and_then(Value::as_str).unwrap_or("");
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");

    match status {
        "RESOURCE_EXHAUSTED" => Some(BackendFailure::rate_limited(
            message,
            parse_retry_after(headers),
        )),
        "UNAUTHENTICATED" | "PERMISSION_DENIED" => Some(BackendFailure::auth(message)),
        "INVALID_ARGUMENT" if message.contains("API key not valid") => {
            Some(BackendFailure::auth(message))
        }
        "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" => {
            Some(BackendFailure::transient(message))
        }
        _ => None,
    }
}

#[async_trait]
impl Backend for GeminiProvider {
    fn provider_name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn probe(&self) -> (Availability, Option<String>) {
        let primary = probe_credential(&self.api_key, "AIza");
        if primary.0 != Availability::Available {
            if let Some(backup) = &self.backup_key {
                if probe_credential(backup, "AIza").0 == Availability::Available {
                    return (Availability::Available, None);
                }
            }
        }
        primary
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        if let Some(budget) = &self.budget {
            match budget.try_acquire() {
                Ok(()) => {}
                Err(BudgetExceeded::Minute { wait }) => {
                    return Err(BackendFailure::rate_limited(
                        "local per-minute request budget exhausted",
                        Some(wait),
                    ));
                }
                Err(BudgetExceeded::Daily { used }) => {
                    return Err(BackendFailure::rate_limited(
                        format!("local daily request budget exhausted ({} requests)", used),
                        None,
                    ));
                }
            }
        }

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = self.to_gemini_request(messages);

        debug!(
            "Gemini request: model={}, contents={}, backup={}",
            self.model,
            body.contents.len(),
            self.on_backup()
        );

        let value = match self.send(&url, &body, timeout).await {
            Err(failure)
                if failure.kind == FailureKind::RateLimited
                    && self.switch_to_backup() =>
            {
                self.send(&url, &body, timeout).await?
            }
            other => other?,
        };

        let api_response: GeminiApiResponse = serde_json::from_value(value)
            .map_err(|e| BackendFailure::malformed(format!("unexpected response shape: {}", e)))?;

        Self::from_gemini_response(api_response)
    }

    fn rate_limit_status(&self) -> Option<RateLimitStatus> {
        self.budget.as_ref().map(RequestBudget::status)
    }
}

// ── Gemini wire types ──

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiApiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}
