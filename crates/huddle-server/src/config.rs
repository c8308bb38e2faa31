//! Layered server configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`HuddleConfig::default()`]
//! 2. Merge the JSON settings file if it exists
//! 3. Merge `HUDDLE_`-prefixed environment variables, `__` separating
//!    sections (`HUDDLE_SERVER__PORT=9000`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(#[from] Box<figment::Error>);

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self(Box::new(e))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HuddleConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub telemetry: TelemetrySettings,
}

impl HuddleConfig {
    /// Defaults, then `path` if present, then the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(HuddleConfig::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed("HUDDLE_").split("__"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::figment(path).extract()?)
    }
}

/// `~/.huddle/settings.json`.
pub fn default_config_path() -> PathBuf {
    huddle_dir().join("settings.json")
}

fn huddle_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".huddle")
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// How long graceful shutdown waits for server tasks.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Empty hubs idle this long shut themselves down.
    pub idle_timeout_secs: u64,
    /// How often each hub checks its own idleness.
    pub idle_check_interval_secs: u64,
    /// How often the manager evicts empty hubs.
    pub sweep_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            idle_check_interval_secs: 1800,
            sweep_interval_secs: 300,
        }
    }
}

impl HubConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-connection outbound queue capacity. A full queue evicts the session.
    pub send_queue_capacity: usize,
    pub ping_interval_secs: u64,
    /// Read deadline, refreshed by every inbound frame.
    pub pong_wait_secs: u64,
    pub write_timeout_secs: u64,
    /// Messages replayed to a newly admitted connection.
    pub history_limit: u32,
    /// Admission attempts before giving up on a room.
    pub admit_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            ping_interval_secs: 54,
            pong_wait_secs: 60,
            write_timeout_secs: 10,
            history_limit: 10,
            admit_attempts: 3,
        }
    }
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// Presence rows untouched this long are purged.
    pub presence_stale_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: huddle_dir().join("huddle.db"),
            presence_stale_secs: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Default level directive, e.g. `"info"`. `RUST_LOG` wins when set.
    pub level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub metrics_enabled: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            log_to_sqlite: false,
            log_db_path: huddle_dir().join("logs.db"),
            metrics_enabled: true,
        }
    }
}
