//! Backend identity and capability records

use serde::{Deserialize, Serialize};

/// Whether a backend can currently be selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    NotConfigured,
    Error,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::NotConfigured => write!(f, "not_configured"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Identity and capability record for one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub requires_credential: bool,
    pub availability: Availability,
    /// Why the backend is not available, when it isn't
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl BackendDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: String::new(),
            requires_credential: true,
            availability: Availability::NotConfigured,
            detail: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn without_credential(mut self) -> Self {
        self.requires_credential = false;
        self
    }

    /// Replace the availability fields with a probe result
    pub fn with_availability(mut self, (availability, detail): (Availability, Option<String>)) -> Self {
        self.availability = availability;
        self.detail = if availability == Availability::Available {
            None
        } else {
            detail
        };
        self
    }

    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }
}

/// Check that a credential is present and carries the provider's prefix.
///
/// Missing or blank keys are `not_configured`; present keys with the wrong
/// shape are `error`.
pub fn probe_credential(key: &str, expected_prefix: &str) -> (Availability, Option<String>) {
    let key = key.trim();
    if key.is_empty() || key.contains("${") {
        return (
            Availability::NotConfigured,
            Some("API key not configured".to_string()),
        );
    }
    if !expected_prefix.is_empty() && !key.starts_with(expected_prefix) {
        return (
            Availability::Error,
            Some(format!(
                "Invalid API key format (expected prefix '{}')",
                expected_prefix
            )),
        );
    }
    (Availability::Available, None)
}
