//! SQLite persistence for huddle: presence rows, chat history, rooms, and
//! display names, exposed to the fan-out layer through [`ChatStore`].

pub mod database;
pub mod error;
pub mod messages;
pub mod port;
pub mod presence;
pub mod rooms;
pub mod row_helpers;
pub mod schema;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use port::{ChatStore, SqliteStore, DEFAULT_PRESENCE_STALE_SECS};
