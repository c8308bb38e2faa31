//! In-memory `ChatStore` for unit tests, with switches to fail individual calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use huddle_core::{ActiveUser, RoomId, SessionToken, StoredMessage, UserId, WireEvent};
use huddle_store::{ChatStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<UserId, String>>,
    rooms: Mutex<Vec<String>>,
    sessions: Mutex<Vec<(UserId, RoomId, SessionToken, DateTime<Utc>)>>,
    messages: Mutex<Vec<StoredMessage>>,
    pub fail_create: AtomicBool,
    pub fail_presence: AtomicBool,
    pub removals: AtomicUsize,
}

impl MemoryStore {
    pub fn with_users(users: &[(i64, &str)]) -> Self {
        let store = Self::default();
        {
            let mut map = store.users.lock();
            for (id, name) in users {
                map.insert(UserId::new(*id), (*name).to_string());
            }
        }
        store
    }

    pub fn session_count(&self, room: RoomId) -> usize {
        self.sessions.lock().iter().filter(|s| s.1 == room).count()
    }

    pub fn messages_in(&self, room: RoomId) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.room_id == room)
            .map(|m| m.content.clone())
            .collect()
    }

    fn failure(op: &str) -> StoreError {
        StoreError::Database(format!("{op}: injected failure"))
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_session(
        &self,
        user: UserId,
        room: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::failure("create_session"));
        }
        let mut sessions = self.sessions.lock();
        if !sessions.iter().any(|s| s.0 == user && s.1 == room && &s.2 == token) {
            sessions.push((user, room, token.clone(), Utc::now()));
        }
        Ok(())
    }

    async fn remove_session(
        &self,
        user: UserId,
        room: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .retain(|s| !(s.0 == user && s.1 == room && &s.2 == token));
        Ok(())
    }

    async fn touch_session(&self, _: UserId, _: RoomId, _: &SessionToken) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_active_users(&self, room: RoomId) -> Result<Vec<ActiveUser>, StoreError> {
        if self.fail_presence.load(Ordering::SeqCst) {
            return Err(Self::failure("list_active_users"));
        }
        let users = self.users.lock();
        let mut active: Vec<ActiveUser> = Vec::new();
        for (user, _, _, at) in self.sessions.lock().iter().filter(|s| s.1 == room) {
            if active.iter().any(|a| a.id == *user) {
                continue;
            }
            let name = users.get(user).cloned().unwrap_or_default();
            active.push(ActiveUser::online(*user, name, *at, *at));
        }
        active.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(active)
    }

    async fn save_message(&self, user: UserId, room: RoomId, text: &str) -> Result<(), StoreError> {
        let username = self.users.lock().get(&user).cloned().unwrap_or_default();
        let mut messages = self.messages.lock();
        let id = messages.len() as i64 + 1;
        messages.push(StoredMessage {
            id,
            user_id: user,
            room_id: room,
            username,
            content: text.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent_messages(
        &self,
        room: RoomId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.lock();
        let in_room: Vec<_> = messages.iter().filter(|m| m.room_id == room).cloned().collect();
        let skip = in_room.len().saturating_sub(limit as usize);
        Ok(in_room.into_iter().skip(skip).collect())
    }

    async fn resolve_or_create_room(&self, name: &str) -> Result<RoomId, StoreError> {
        let mut rooms = self.rooms.lock();
        let index = match rooms.iter().position(|r| r == name) {
            Some(index) => index,
            None => {
                rooms.push(name.to_string());
                rooms.len() - 1
            }
        };
        Ok(RoomId::new(index as i64 + 1))
    }

    async fn register_user(&self, user: UserId, username: &str) -> Result<(), StoreError> {
        self.users.lock().insert(user, username.to_string());
        Ok(())
    }
}

/// Everything currently buffered in a session queue, decoded.
pub fn drain(rx: &mut mpsc::Receiver<std::sync::Arc<str>>) -> Vec<WireEvent> {
    let mut events = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        events.push(serde_json::from_str(&payload).unwrap());
    }
    events
}

pub fn chat_texts(events: &[WireEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            WireEvent::Message { text, sender, .. } => Some((text.clone(), sender.clone())),
            WireEvent::PresenceUpdate { .. } => None,
        })
        .collect()
}

pub fn presence_counts(events: &[WireEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            WireEvent::PresenceUpdate { user_count, .. } => Some(*user_count),
            WireEvent::Message { .. } => None,
        })
        .collect()
}
