use tracing::instrument;

use huddle_core::ids::RoomId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct RoomRepo {
    db: Database,
}

impl RoomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Look up a room by name, creating it as a public room if absent.
    #[instrument(skip(self))]
    pub fn resolve_or_create(&self, name: &str) -> Result<RoomId, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (name, is_public, created_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(name) DO NOTHING",
                rusqlite::params![name, row_helpers::now_timestamp()],
            )?;
            let id: i64 =
                conn.query_row("SELECT id FROM rooms WHERE name = ?1", [name], |row| row.get(0))?;
            Ok(RoomId::new(id))
        })
    }

    pub fn name(&self, id: RoomId) -> Result<String, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM rooms WHERE id = ?1")?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => row_helpers::get(row, 0, "rooms", "name"),
                None => Err(StoreError::NotFound(format!("room {id}"))),
            }
        })
    }
}
