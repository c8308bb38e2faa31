//! Frames sent to clients over the socket, one JSON object per text frame.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::presence::{ActiveUser, StoredMessage};

/// Sender name used for replayed history.
pub const SYSTEM_SENDER: &str = "system";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Message {
        text: String,
        sender: String,
        timestamp: String,
    },
    PresenceUpdate {
        active_users: Vec<ActiveUser>,
        user_count: usize,
        timestamp: String,
    },
}

impl WireEvent {
    /// A live chat line from `sender`.
    pub fn chat(text: impl Into<String>, sender: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::Message {
            text: text.into(),
            sender: sender.into(),
            timestamp: wire_timestamp(at),
        }
    }

    /// A stored message replayed to a newly admitted connection.
    pub fn history(message: &StoredMessage) -> Self {
        Self::Message {
            text: format!("{}: {}", message.username, message.content),
            sender: SYSTEM_SENDER.into(),
            timestamp: wire_timestamp(message.created_at),
        }
    }

    pub fn presence(active_users: Vec<ActiveUser>, at: DateTime<Utc>) -> Self {
        Self::PresenceUpdate {
            user_count: active_users.len(),
            active_users,
            timestamp: wire_timestamp(at),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::PresenceUpdate { .. } => "presence_update",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// RFC 3339, second precision, `Z` suffix.
pub fn wire_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
