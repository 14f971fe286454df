use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of every message the delivery path injects into a conversation.
pub const ANALYSIS_MARKER: &str = "[Background Analysis]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn is_injected(&self) -> bool {
        self.content.contains(ANALYSIS_MARKER)
    }
}

/// Remembers the last analyzed user turn so it is never analyzed twice.
#[derive(Debug, Default)]
pub struct TurnTracker {
    last: Option<(DateTime<Utc>, String)>,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record in one step. Only user turns that are not injected
    /// analysis output and differ from the last analyzed turn pass.
    pub fn should_analyze(&mut self, turn: &ConversationTurn) -> bool {
        if turn.role != "user" || turn.is_injected() {
            return false;
        }
        if let Some((timestamp, content)) = &self.last {
            if *timestamp == turn.timestamp && *content == turn.content {
                return false;
            }
        }
        self.last = Some((turn.timestamp, turn.content.clone()));
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
