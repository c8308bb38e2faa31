use chrono::{Duration, Utc};
use tracing::{debug, instrument};

use huddle_core::ids::{RoomId, SessionToken, UserId};
use huddle_core::presence::ActiveUser;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Rows in `active_sessions`, one per live connection.
pub struct PresenceRepo {
    db: Database,
}

impl PresenceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, token), fields(user_id = %user_id, room_id = %room_id))]
    pub fn create(
        &self,
        user_id: UserId,
        room_id: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError> {
        let now = row_helpers::now_timestamp();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO active_sessions (user_id, room_id, session_token, connected_at, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user_id, room_id, session_token) DO UPDATE SET last_seen = excluded.last_seen",
                rusqlite::params![user_id.get(), room_id.get(), token.as_str(), now],
            )?;
            Ok(())
        })
    }

    /// Returns whether a row was actually deleted.
    pub fn remove(
        &self,
        user_id: UserId,
        room_id: RoomId,
        token: &SessionToken,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM active_sessions WHERE user_id = ?1 AND room_id = ?2 AND session_token = ?3",
                rusqlite::params![user_id.get(), room_id.get(), token.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn touch(
        &self,
        user_id: UserId,
        room_id: RoomId,
        token: &SessionToken,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE active_sessions SET last_seen = ?4
                 WHERE user_id = ?1 AND room_id = ?2 AND session_token = ?3",
                rusqlite::params![
                    user_id.get(),
                    room_id.get(),
                    token.as_str(),
                    row_helpers::now_timestamp()
                ],
            )?;
            Ok(())
        })
    }

    /// Purge rows not seen within `stale_after` (every room), then list the
    /// distinct users still online in `room_id`, ordered by username.
    #[instrument(skip(self), fields(room_id = %room_id))]
    pub fn list_active(
        &self,
        room_id: RoomId,
        stale_after: Duration,
    ) -> Result<Vec<ActiveUser>, StoreError> {
        let cutoff = row_helpers::format_timestamp(Utc::now() - stale_after);
        self.db.with_conn(|conn| {
            let purged = conn.execute("DELETE FROM active_sessions WHERE last_seen < ?1", [&cutoff])?;
            if purged > 0 {
                debug!(purged, "purged stale presence rows");
            }

            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, MIN(s.connected_at), MAX(s.last_seen)
                 FROM active_sessions s
                 JOIN users u ON s.user_id = u.id
                 WHERE s.room_id = ?1
                 GROUP BY u.id, u.username
                 ORDER BY u.username",
            )?;
            let mut rows = stmt.query([room_id.get()])?;
            let mut users = Vec::new();
            while let Some(row) = rows.next()? {
                users.push(ActiveUser::online(
                    UserId::new(row_helpers::get(row, 0, "users", "id")?),
                    row_helpers::get::<String>(row, 1, "users", "username")?,
                    row_helpers::get_timestamp(row, 2, "active_sessions", "connected_at")?,
                    row_helpers::get_timestamp(row, 3, "active_sessions", "last_seen")?,
                ));
            }
            Ok(users)
        })
    }

    pub fn count_for_room(&self, room_id: RoomId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM active_sessions WHERE room_id = ?1",
                [room_id.get()],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomRepo;
    use crate::users::UserRepo;

    struct Fixture {
        db: Database,
        repo: PresenceRepo,
        lobby: RoomId,
        other: RoomId,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        users.upsert(UserId::new(1), "zed").unwrap();
        users.upsert(UserId::new(2), "amy").unwrap();
        let rooms = RoomRepo::new(db.clone());
        let lobby = rooms.resolve_or_create("lobby").unwrap();
        let other = rooms.resolve_or_create("other").unwrap();
        Fixture {
            repo: PresenceRepo::new(db.clone()),
            db,
            lobby,
            other,
        }
    }

    fn backdate(db: &Database, token: &SessionToken, minutes: i64) {
        let old = row_helpers::format_timestamp(Utc::now() - Duration::minutes(minutes));
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE active_sessions SET last_seen = ?1 WHERE session_token = ?2",
                rusqlite::params![old, token.as_str()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn lists_users_ordered_by_username() {
        let f = setup();
        f.repo.create(UserId::new(1), f.lobby, &SessionToken::from_raw("t1")).unwrap();
        f.repo.create(UserId::new(2), f.lobby, &SessionToken::from_raw("t2")).unwrap();

        let active = f.repo.list_active(f.lobby, Duration::minutes(5)).unwrap();
        let names: Vec<&str> = active.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, ["amy", "zed"]);
        assert!(active.iter().all(|u| u.status == "online"));
    }

    #[test]
    fn same_user_twice_is_listed_once() {
        let f = setup();
        f.repo.create(UserId::new(1), f.lobby, &SessionToken::from_raw("a")).unwrap();
        f.repo.create(UserId::new(1), f.lobby, &SessionToken::from_raw("b")).unwrap();

        assert_eq!(f.repo.count_for_room(f.lobby).unwrap(), 2);
        let active = f.repo.list_active(f.lobby, Duration::minutes(5)).unwrap();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn create_is_idempotent() {
        let f = setup();
        let token = SessionToken::from_raw("dup");
        f.repo.create(UserId::new(1), f.lobby, &token).unwrap();
        f.repo.create(UserId::new(1), f.lobby, &token).unwrap();
        assert_eq!(f.repo.count_for_room(f.lobby).unwrap(), 1);
    }

    #[test]
    fn remove_reports_whether_row_existed() {
        let f = setup();
        let token = SessionToken::from_raw("gone");
        f.repo.create(UserId::new(1), f.lobby, &token).unwrap();
        assert!(f.repo.remove(UserId::new(1), f.lobby, &token).unwrap());
        assert!(!f.repo.remove(UserId::new(1), f.lobby, &token).unwrap());
        assert!(f.repo.list_active(f.lobby, Duration::minutes(5)).unwrap().is_empty());
    }

    #[test]
    fn stale_rows_are_purged_across_rooms() {
        let f = setup();
        let fresh = SessionToken::from_raw("fresh");
        let stale_here = SessionToken::from_raw("stale-here");
        let stale_there = SessionToken::from_raw("stale-there");
        f.repo.create(UserId::new(1), f.lobby, &fresh).unwrap();
        f.repo.create(UserId::new(2), f.lobby, &stale_here).unwrap();
        f.repo.create(UserId::new(2), f.other, &stale_there).unwrap();
        backdate(&f.db, &stale_here, 10);
        backdate(&f.db, &stale_there, 10);

        let active = f.repo.list_active(f.lobby, Duration::minutes(5)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].username, "zed");
        assert_eq!(f.repo.count_for_room(f.other).unwrap(), 0);
    }

    #[test]
    fn touch_keeps_row_alive() {
        let f = setup();
        let token = SessionToken::from_raw("kept");
        f.repo.create(UserId::new(1), f.lobby, &token).unwrap();
        backdate(&f.db, &token, 10);
        f.repo.touch(UserId::new(1), f.lobby, &token).unwrap();

        let active = f.repo.list_active(f.lobby, Duration::minutes(5)).unwrap();
        assert_eq!(active.len(), 1);
    }
}
