//! Gateway HTTP protocol: JSON bodies exchanged with chat clients

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use taxora_core::{DispatchFailure, DispatchResult, FallbackReason, RouterError};

/// `POST /start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: String,
    pub message: String,
    pub persona: String,
}

/// `POST /chat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    /// One-off backend override for this turn
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub allow_fallback: Option<bool>,
}

/// Reply to a chat turn. `reply` is always something to show the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
    pub success: bool,
    pub backend_used: Option<String>,
    pub fallback_used: bool,
    pub fallback_reason: FallbackReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<DispatchFailure>,
}

pub const APOLOGY: &str =
    "Sorry, something went wrong while preparing your answer. Please try again in a moment.";

impl ChatResponse {
    pub fn from_dispatch(session_id: &str, result: DispatchResult) -> Self {
        Self {
            session_id: session_id.to_string(),
            reply: result.text,
            success: result.success,
            backend_used: Some(result.backend_used),
            fallback_used: result.fallback_used,
            fallback_reason: result.fallback_reason,
            failure: result.failure,
        }
    }

    /// Generic reply when dispatch itself broke
    pub fn apology(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            reply: APOLOGY.to_string(),
            success: false,
            backend_used: None,
            fallback_used: false,
            fallback_reason: FallbackReason::None,
            failure: None,
        }
    }
}

/// `POST /ai/provider`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProviderRequest {
    #[serde(default)]
    pub provider: Option<String>,
}

/// JSON error body with a stable code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub error: String,
    pub code: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            error: error.into(),
            code: code.into(),
        }
    }

    pub fn bad_request(error: impl Into<String>, code: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, code)
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error, "not_found")
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid bearer token",
            "unauthorized",
        )
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        Self::bad_request(err.to_string(), err.code())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}
