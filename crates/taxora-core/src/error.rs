//! Router-level usage errors

use thiserror::Error;

/// Errors from selecting or resolving a backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("AI provider switching is disabled")]
    SwitchingDisabled,

    #[error("unknown AI provider '{0}'")]
    UnknownBackend(String),

    #[error("AI provider '{id}' is not available: {detail}")]
    BackendUnavailable { id: String, detail: String },
}

impl RouterError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::SwitchingDisabled => "switching_disabled",
            Self::UnknownBackend(_) => "unknown_backend",
            Self::BackendUnavailable { .. } => "backend_unavailable",
        }
    }
}
