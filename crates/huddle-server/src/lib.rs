//! Room fan-out for huddle: one hub actor per room, a registry that creates
//! and reclaims hubs, and per-connection sessions bridging sockets to hubs.

pub mod admission;
pub mod config;
pub mod health;
pub mod hub;
pub mod manager;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;

#[cfg(test)]
mod testing;

pub use admission::{Authenticator, GatewayHeaders, Identity};
pub use config::{ConfigError, HuddleConfig};
pub use hub::{Hub, HubError};
pub use manager::HubManager;
pub use server::{build_router, start, AppState, ServerDeps, ServerHandle};
pub use session::{Session, SessionError};
