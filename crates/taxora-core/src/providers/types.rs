//! Provider-agnostic types shared by every backend adapter

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::descriptor::Availability;
use super::failure::BackendFailure;
use super::rate_limit::RateLimitStatus;

/// Provider-agnostic chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Trait that every backend adapter implements.
///
/// Adapters own their wire mapping, timeout handling and failure
/// classification. Anything that goes wrong upstream comes back as a
/// [`BackendFailure`]; adapters never panic on bad responses.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short provider label used in logs (e.g. "gemini", "ollama")
    fn provider_name(&self) -> &str;

    /// Model identifier (e.g. "gemini-2.0-flash", "gpt-4o-mini")
    fn model(&self) -> &str;

    /// Check credential presence and format without touching the network
    fn probe(&self) -> (Availability, Option<String>);

    /// Generate a reply for the conversation within `timeout`
    async fn generate(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure>;

    /// Generate a reply exactly as the model produced it, skipping any
    /// substitution the adapter applies to low-quality output
    async fn generate_unreviewed(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<String, BackendFailure> {
        self.generate(messages, timeout).await
    }

    /// Client-side request budget, for backends that keep one
    fn rate_limit_status(&self) -> Option<RateLimitStatus> {
        None
    }
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Split a conversation into the joined system text and the remaining turns
pub fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let rest = messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .collect();

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, rest)
}

/// Content of the most recent user turn, or an empty string
pub fn last_user_message(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_role_display() {
        assert_eq!(ChatRole::User.to_string(), "user");
        assert_eq!(ChatRole::Assistant.to_string(), "assistant");
        assert_eq!(ChatRole::System.to_string(), "system");
    }

    #[test]
    fn test_chat_message_serde_lowercase_role() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hello"}"#);

        let parsed: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","content":"hi"}"#).unwrap();
        assert_eq!(parsed, ChatMessage::assistant("hi"));
    }

    #[test]
    fn test_split_system_joins_system_turns() {
        let msgs = vec![
            ChatMessage::system("You are an advisor."),
            ChatMessage::user("How do I save?"),
            ChatMessage::system("Be concise."),
            ChatMessage::assistant("Automate it."),
        ];
        let (system, rest) = split_system(&msgs);
        assert_eq!(system.as_deref(), Some("You are an advisor.\n\nBe concise."));
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].role, ChatRole::User);
    }

    #[test]
    fn test_split_system_none() {
        let msgs = vec![ChatMessage::user("hi")];
        let (system, rest) = split_system(&msgs);
        assert!(system.is_none());
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_last_user_message() {
        let msgs = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
            ChatMessage::assistant("reply 2"),
        ];
        assert_eq!(last_user_message(&msgs), "second");
        assert_eq!(last_user_message(&[]), "");
    }
}
