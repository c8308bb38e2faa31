use tracing::instrument;

use huddle_core::ids::{RoomId, UserId};
use huddle_core::presence::StoredMessage;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, content), fields(user_id = %user_id, room_id = %room_id, len = content.len()))]
    pub fn save(&self, user_id: UserId, room_id: RoomId, content: &str) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (user_id, room_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user_id.get(), room_id.get(), content, row_helpers::now_timestamp()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// The newest `limit` messages of a room, returned oldest first.
    #[instrument(skip(self), fields(room_id = %room_id))]
    pub fn recent(&self, room_id: RoomId, limit: u32) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.user_id, m.room_id, u.username, m.content, m.created_at
                 FROM messages m
                 JOIN users u ON m.user_id = u.id
                 WHERE m.room_id = ?1
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![room_id.get(), limit])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                messages.push(row_to_message(row)?);
            }
            messages.reverse();
            Ok(messages)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<StoredMessage, StoreError> {
    Ok(StoredMessage {
        id: row_helpers::get(row, 0, "messages", "id")?,
        user_id: UserId::new(row_helpers::get(row, 1, "messages", "user_id")?),
        room_id: RoomId::new(row_helpers::get(row, 2, "messages", "room_id")?),
        username: row_helpers::get(row, 3, "users", "username")?,
        content: row_helpers::get(row, 4, "messages", "content")?,
        created_at: row_helpers::get_timestamp(row, 5, "messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomRepo;
    use crate::users::UserRepo;

    fn setup() -> (MessageRepo, RoomId, RoomId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        users.upsert(UserId::new(1), "alice").unwrap();
        users.upsert(UserId::new(2), "bob").unwrap();
        let rooms = RoomRepo::new(db.clone());
        let lobby = rooms.resolve_or_create("lobby").unwrap();
        let other = rooms.resolve_or_create("other").unwrap();
        (MessageRepo::new(db), lobby, other)
    }

    #[test]
    fn recent_is_oldest_first_and_limited() {
        let (repo, lobby, _) = setup();
        for i in 0..15 {
            let author = if i % 2 == 0 { UserId::new(1) } else { UserId::new(2) };
            repo.save(author, lobby, &format!("msg {i}")).unwrap();
        }

        let recent = repo.recent(lobby, 10).unwrap();
        assert_eq!(recent.len(), 10);
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        let expected: Vec<String> = (5..15).map(|i| format!("msg {i}")).collect();
        assert_eq!(contents, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(recent[0].username, "bob");
        assert_eq!(recent[9].username, "alice");
    }

    #[test]
    fn recent_is_scoped_to_room() {
        let (repo, lobby, other) = setup();
        repo.save(UserId::new(1), lobby, "here").unwrap();
        repo.save(UserId::new(1), other, "elsewhere").unwrap();

        let recent = repo.recent(lobby, 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "here");
        assert_eq!(recent[0].room_id, lobby);
    }

    #[test]
    fn empty_room_has_no_history() {
        let (repo, lobby, _) = setup();
        assert!(repo.recent(lobby, 10).unwrap().is_empty());
    }
}
