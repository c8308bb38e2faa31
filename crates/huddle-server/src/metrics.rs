//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Fails if a global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// WebSocket sessions admitted to a hub (counter).
pub const SESSIONS_TOTAL: &str = "huddle_sessions_total";
/// Sessions currently running their pumps (gauge).
pub const SESSIONS_ACTIVE: &str = "huddle_sessions_active";
/// Sessions refused before admission (counter, labels: reason).
pub const SESSIONS_REJECTED_TOTAL: &str = "huddle_sessions_rejected_total";
/// Chat messages received from clients (counter).
pub const MESSAGES_TOTAL: &str = "huddle_messages_total";
/// Payloads fanned out by hubs (counter).
pub const HUB_BROADCASTS_TOTAL: &str = "huddle_hub_broadcasts_total";
/// Sessions evicted for a full or closed queue (counter).
pub const HUB_EVICTIONS_TOTAL: &str = "huddle_hub_evictions_total";
/// Live hubs in the registry (gauge).
pub const HUBS_ACTIVE: &str = "huddle_hubs_active";
/// Persistence calls that failed on a non-critical path (counter, labels: op).
pub const STORE_ERRORS_TOTAL: &str = "huddle_store_errors_total";
