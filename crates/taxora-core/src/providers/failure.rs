//! Typed failure signals raised by backend adapters

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Classification of an upstream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    Transient,
    Auth,
    Malformed,
}

/// Failure reported by an adapter after its own retries are exhausted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendFailure {
    pub kind: FailureKind,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl BackendFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            retry_after,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Auth, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Malformed, message)
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Whether the shared retry helper may try again
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::RateLimited | FailureKind::Transient)
    }

    /// Classify a transport-level error from reqwest
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transient(format!("request timed out: {}", err))
        } else if err.is_connect() {
            Self::transient(format!("connection failed: {}", err))
        } else if err.is_decode() || err.is_body() {
            Self::malformed(format!("could not read response body: {}", err))
        } else {
            Self::transient(format!("request failed: {}", err))
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Transient => write!(f, "transient"),
            Self::Auth => write!(f, "auth"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

/// Map a non-success HTTP status to a failure kind.
///
/// Returns `None` for 2xx statuses.
pub fn classify_status(status: StatusCode) -> Option<FailureKind> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(FailureKind::RateLimited)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Some(FailureKind::Auth)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Some(FailureKind::Transient)
    } else {
        Some(FailureKind::Malformed)
    }
}

/// Parse a `retry-after` header given in whole seconds
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
