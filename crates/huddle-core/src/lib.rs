//! Shared vocabulary for the room fan-out layer: identifiers, presence rows,
//! and the JSON frames delivered to clients.

pub mod events;
pub mod ids;
pub mod presence;

pub use events::WireEvent;
pub use ids::{RoomId, SessionToken, UserId};
pub use presence::{ActiveUser, StoredMessage};
