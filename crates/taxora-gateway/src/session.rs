//! Session store: each conversation keeps its own message history in memory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taxora_core::{ChatMessage, ChatRole, UserRole, build_system_prompt};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Non-system messages sent upstream with each turn
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

/// Non-system messages kept per session
const MAX_STORED_MESSAGES: usize = 200;

/// A single chat session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub role: UserRole,
    pub history: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Public view of a session, without the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub name: String,
    pub role: UserRole,
    /// User and assistant turns, excluding the system prompt
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            name: self.name.clone(),
            role: self.role,
            message_count: self
                .history
                .iter()
                .filter(|m| m.role != ChatRole::System)
                .count(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    /// System prompt plus the most recent turns, starting on a user turn
    fn conversation(&self, window: usize) -> Vec<ChatMessage> {
        let (system, turns): (Vec<&ChatMessage>, Vec<&ChatMessage>) = self
            .history
            .iter()
            .partition(|m| m.role == ChatRole::System);
        let recent = &turns[turns.len().saturating_sub(window)..];
        let start = recent
            .iter()
            .position(|m| m.role == ChatRole::User)
            .unwrap_or(recent.len());

        system
            .into_iter()
            .chain(recent[start..].iter().copied())
            .cloned()
            .collect()
    }

    fn trim(&mut self) {
        let stored = self
            .history
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .count();
        let mut excess = stored.saturating_sub(MAX_STORED_MESSAGES);
        if excess == 0 {
            return;
        }
        self.history.retain(|m| {
            if excess > 0 && m.role != ChatRole::System {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Manages all active sessions
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    history_window: usize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    /// Cap on the non-system messages sent upstream per turn (at least 1)
    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    /// Start a session seeded with the system prompt for `name` and `role`
    pub async fn create(&self, name: &str, role: UserRole) -> SessionInfo {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            name: name.trim().to_string(),
            role,
            history: vec![ChatMessage::system(build_system_prompt(name, role))],
            created_at: now,
            last_activity: now,
        };
        let info = session.info();
        self.sessions.write().await.insert(id.clone(), session);
        info!("Created session for a {} ({})", role, id);
        info
    }

    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).map(Session::info)
    }

    /// Append a user turn and return the conversation to dispatch: the
    /// system prompt plus the latest turns within the history window.
    pub async fn push_user(&self, id: &str, text: &str) -> Option<Vec<ChatMessage>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        session.history.push(ChatMessage::user(text));
        session.last_activity = Utc::now();
        session.trim();
        let conversation = session.conversation(self.history_window);
        debug!(
            "Session '{}' has {} messages, sending {}",
            id,
            session.history.len(),
            conversation.len()
        );
        Some(conversation)
    }

    /// Append an assistant turn. Returns false if the session ended meanwhile.
    pub async fn push_assistant(&self, id: &str, text: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) => {
                session.history.push(ChatMessage::assistant(text));
                session.last_activity = Utc::now();
                session.trim();
                true
            }
            None => false,
        }
    }

    /// Drop an unanswered user turn so roles keep alternating.
    /// Only removes the latest message, and only if it is that user turn.
    pub async fn retract_user(&self, id: &str, text: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        match session.history.last() {
            Some(last) if last.role == ChatRole::User && last.content == text => {
                session.history.pop();
                debug!("Session '{}' dropped an unanswered turn", id);
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!("Ended session {}", id);
        }
        removed
    }

    /// Session ids, most recently active first
    pub async fn ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<&Session> = sessions.values().collect();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        list.into_iter().map(|s| s.id.clone()).collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
