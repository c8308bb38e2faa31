//! # huddle
//!
//! Chat room server binary: loads settings, wires the store, telemetry and
//! metrics together, and serves until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;

use huddle_server::config::{default_config_path, HuddleConfig, TelemetrySettings};
use huddle_server::{GatewayHeaders, ServerDeps};
use huddle_store::{Database, SqliteStore};
use huddle_telemetry::TelemetryConfig;

/// Huddle chat room server.
#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Huddle chat room server")]
struct Cli {
    /// Settings file (JSON). Missing files fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut HuddleConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(db_path) = self.db_path {
            config.store.db_path = db_path;
        }
    }
}

fn telemetry_config(settings: &TelemetrySettings) -> Result<TelemetryConfig> {
    let log_level: Level = settings
        .level
        .parse()
        .with_context(|| format!("Invalid log level: {}", settings.level))?;
    Ok(TelemetryConfig {
        log_level,
        json: settings.json,
        log_to_sqlite: settings.log_to_sqlite,
        log_db_path: settings.log_db_path.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = HuddleConfig::load(&config_path)
        .with_context(|| format!("Failed to load settings from {}", config_path.display()))?;
    args.apply(&mut config);

    let telemetry = huddle_telemetry::init_telemetry(telemetry_config(&config.telemetry)?)
        .context("Failed to initialize logging")?;
    if let Some(log_db) = telemetry.log_db() {
        tracing::info!(path = %log_db.display(), "persisting warnings to SQLite");
    }

    let metrics = if config.telemetry.metrics_enabled {
        Some(huddle_server::metrics::install_recorder().context("Failed to install metrics recorder")?)
    } else {
        None
    };

    let db = Database::open(&config.store.db_path).context("Failed to open database")?;
    let store = SqliteStore::new(db)
        .with_stale_after(chrono::Duration::seconds(config.store.presence_stale_secs));

    let server = huddle_server::start(
        &config,
        ServerDeps {
            store: Arc::new(store),
            authenticator: Arc::new(GatewayHeaders),
            metrics,
        },
    )
    .await
    .context("Failed to bind server")?;

    tracing::info!(addr = %server.local_addr(), db = %config.store.db_path.display(), "huddle ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
