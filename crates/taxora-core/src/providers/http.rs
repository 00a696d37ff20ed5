//! Single HTTP exchange shared by the remote adapters

use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::failure::{BackendFailure, FailureKind, classify_status, parse_retry_after};

/// Provider-specific failure signature check.
///
/// Runs on every parsed JSON body before generic status classification, so
/// providers can recognize errors they report in their own shape.
pub type FailureDetector = fn(StatusCode, &HeaderMap, &Value) -> Option<BackendFailure>;

/// Detector for providers with no special error shape
pub fn no_signature(_: StatusCode, _: &HeaderMap, _: &Value) -> Option<BackendFailure> {
    None
}

/// Send one request and return the JSON body, classifying every failure
pub async fn exchange(
    request: RequestBuilder,
    timeout: Duration,
    detect: FailureDetector,
) -> Result<Value, BackendFailure> {
    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| BackendFailure::from_transport(&e))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .text()
        .await
        .map_err(|e| BackendFailure::from_transport(&e))?;

    debug!("HTTP {} with {} byte body", status, body.len());

    let parsed: Option<Value> = serde_json::from_str(&body).ok();

    if let Some(failure) = parsed
        .as_ref()
        .and_then(|value| detect(status, &headers, value))
    {
        return Err(failure);
    }

    if let Some(kind) = classify_status(status) {
        let retry_after = match kind {
            FailureKind::RateLimited | FailureKind::Transient => parse_retry_after(&headers),
            _ => None,
        };
        return Err(BackendFailure {
            kind,
            retry_after,
            message: format!("HTTP {}: {}", status, snippet(&body)),
        });
    }

    if body.trim().is_empty() {
        return Err(BackendFailure::malformed("empty response body"));
    }

    parsed.ok_or_else(|| BackendFailure::malformed("response body is not valid JSON"))
}

/// First 200 characters of a body, for error messages
pub fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        let cut: String = trimmed.chars().take(200).collect();
        format!("{}...", cut)
    } else {
        trimmed.to_string()
    }
}
