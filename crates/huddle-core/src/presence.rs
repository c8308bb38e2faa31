use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, UserId};

/// One user currently connected to a room, as reported by the presence store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub id: UserId,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: String,
}

impl ActiveUser {
    pub fn online(
        id: UserId,
        username: impl Into<String>,
        connected_at: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            username: username.into(),
            connected_at,
            last_seen,
            status: "online".into(),
        }
    }
}

/// A persisted chat message joined with its author's display name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
