mod logging;

pub use logging::{SqliteLogLayer, SqliteLogSink};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            json: true,
            log_to_sqlite: false,
            log_db_path: huddle_dir().join("logs.db"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Returned by [`init_telemetry`]; hold it for the life of the process.
pub struct TelemetryGuard {
    log_db: Option<PathBuf>,
}

impl TelemetryGuard {
    /// Where WARN+ events are being persisted, if anywhere.
    pub fn log_db(&self) -> Option<&Path> {
        self.log_db.as_deref()
    }
}

/// `RUST_LOG` when set, otherwise everything at or above `level`.
fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    // A broken log database degrades to stdout-only logging.
    let sqlite_layer = if config.log_to_sqlite {
        match SqliteLogSink::open(&config.log_db_path) {
            Ok(sink) => Some(SqliteLogLayer::new(Arc::new(sink))),
            Err(e) => {
                eprintln!("huddle-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };
    let log_db = sqlite_layer.as_ref().map(|_| config.log_db_path.clone());

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter(config.log_level)))
        .with(sqlite_layer)
        .try_init()?;

    Ok(TelemetryGuard { log_db })
}

/// Fallback home dir for default paths.
fn huddle_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".huddle")
}
