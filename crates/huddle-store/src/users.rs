use tracing::instrument;

use huddle_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Display names for users authenticated by the upstream gateway.
/// Accounts themselves live with the auth service; this table only mirrors
/// what presence and history need to render.
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the user or refresh their display name.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn upsert(&self, id: UserId, username: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username, updated_at = excluded.updated_at",
                rusqlite::params![id.get(), username, row_helpers::now_timestamp()],
            )?;
            Ok(())
        })
    }

    pub fn username(&self, id: UserId) -> Result<String, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT username FROM users WHERE id = ?1")?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => row_helpers::get(row, 0, "users", "username"),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }
}
