use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use huddle_core::ids::{RoomId, SessionToken, UserId};
use huddle_core::presence::{ActiveUser, StoredMessage};

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::presence::PresenceRepo;
use crate::rooms::RoomRepo;
use crate::users::UserRepo;

/// Seconds after which an untouched presence row is considered stale.
pub const DEFAULT_PRESENCE_STALE_SECS: i64 = 300;

/// Everything the fan-out layer needs from persistence.
///
/// Implementations must tolerate concurrent calls from every live session.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Upsert the presence row for a connection; refreshes `last_seen` on conflict.
    async fn create_session(
        &self,
        user: UserId,
        room: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError>;

    async fn remove_session(
        &self,
        user: UserId,
        room: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError>;

    async fn touch_session(
        &self,
        user: UserId,
        room: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError>;

    /// Purges stale rows across all rooms, then lists distinct users in `room`.
    async fn list_active_users(&self, room: RoomId) -> Result<Vec<ActiveUser>, StoreError>;

    async fn save_message(&self, user: UserId, room: RoomId, text: &str) -> Result<(), StoreError>;

    /// Most recent `limit` messages, oldest first.
    async fn recent_messages(
        &self,
        room: RoomId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    async fn resolve_or_create_room(&self, name: &str) -> Result<RoomId, StoreError>;

    async fn register_user(&self, user: UserId, username: &str) -> Result<(), StoreError>;
}

/// `ChatStore` over SQLite. Each call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    users: Arc<UserRepo>,
    rooms: Arc<RoomRepo>,
    messages: Arc<MessageRepo>,
    presence: Arc<PresenceRepo>,
    stale_after: Duration,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            users: Arc::new(UserRepo::new(db.clone())),
            rooms: Arc::new(RoomRepo::new(db.clone())),
            messages: Arc::new(MessageRepo::new(db.clone())),
            presence: Arc::new(PresenceRepo::new(db)),
            stale_after: Duration::seconds(DEFAULT_PRESENCE_STALE_SECS),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

async fn blocking<R, T, F>(repo: &Arc<R>, f: F) -> Result<T, StoreError>
where
    R: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&R) -> Result<T, StoreError> + Send + 'static,
{
    let repo = Arc::clone(repo);
    tokio::task::spawn_blocking(move || f(&repo)).await?
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_session(
        &self,
        user: UserId,
        room: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError> {
        let token = token.clone();
        blocking(&self.presence, move |repo| repo.create(user, room, &token)).await
    }

    async fn remove_session(
        &self,
        user: UserId,
        room: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError> {
        let token = token.clone();
        blocking(&self.presence, move |repo| repo.remove(user, room, &token).map(|_| ())).await
    }

    async fn touch_session(
        &self,
        user: UserId,
        room: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError> {
        let token = token.clone();
        blocking(&self.presence, move |repo| repo.touch(user, room, &token)).await
    }

    async fn list_active_users(&self, room: RoomId) -> Result<Vec<ActiveUser>, StoreError> {
        let stale_after = self.stale_after;
        blocking(&self.presence, move |repo| repo.list_active(room, stale_after)).await
    }

    async fn save_message(&self, user: UserId, room: RoomId, text: &str) -> Result<(), StoreError> {
        let text = text.to_owned();
        blocking(&self.messages, move |repo| repo.save(user, room, &text).map(|_| ())).await
    }

    async fn recent_messages(
        &self,
        room: RoomId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        blocking(&self.messages, move |repo| repo.recent(room, limit)).await
    }

    async fn resolve_or_create_room(&self, name: &str) -> Result<RoomId, StoreError> {
        let name = name.to_owned();
        blocking(&self.rooms, move |repo| repo.resolve_or_create(&name)).await
    }

    async fn register_user(&self, user: UserId, username: &str) -> Result<(), StoreError> {
        let username = username.to_owned();
        blocking(&self.users, move |repo| repo.upsert(user, &username)).await
    }
}
