//! Axum front door: WebSocket admission plus health, presence, and metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use huddle_core::{ActiveUser, RoomId};
use huddle_store::ChatStore;

use crate::admission::{AdmissionError, Authenticator, Identity};
use crate::config::{HuddleConfig, SessionConfig};
use crate::health::{self, HealthResponse};
use crate::manager::HubManager;
use crate::metrics::SESSIONS_REJECTED_TOTAL;
use crate::session::{Admission, Session, SessionDeps};
use crate::shutdown::ShutdownCoordinator;

/// Room joined when `/ws` is called without `?room=`.
pub const DEFAULT_ROOM: &str = "general";

/// External collaborators the server is assembled from.
pub struct ServerDeps {
    pub store: Arc<dyn ChatStore>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Renders `/metrics` when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: HubManager,
    pub store: Arc<dyn ChatStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub session: Arc<SessionConfig>,
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: &HuddleConfig, deps: ServerDeps) -> Self {
        Self {
            manager: HubManager::new(Arc::clone(&deps.store), config.hub.clone()),
            store: deps.store,
            authenticator: deps.authenticator,
            session: Arc::new(config.session.clone()),
            metrics: deps.metrics,
            start_time: Instant::now(),
        }
    }

    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            manager: self.manager.clone(),
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.session),
        }
    }
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = AdmissionError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state.authenticator.authenticate(&parts.headers)
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms/{room_id}/active", get(active_users_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    room: Option<String>,
}

/// GET /ws?room=<name>
///
/// Identity is checked before the upgrade so unauthenticated clients get a
/// plain 401. The presence row is created after the upgrade; if that fails
/// the socket is closed without joining the room.
async fn ws_handler(
    State(state): State<AppState>,
    identity: Identity,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AdmissionError> {
    let room_name = params
        .room
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_ROOM)
        .to_string();

    state
        .store
        .register_user(identity.user_id, &identity.username)
        .await?;
    let room_id = state.store.resolve_or_create_room(&room_name).await?;
    debug!(user_id = %identity.user_id, room = %room_name, room_id = %room_id, "upgrading");

    let admission = Admission {
        user_id: identity.user_id,
        username: identity.username,
        room_id,
    };
    let deps = state.session_deps();

    Ok(ws.on_upgrade(move |mut socket| async move {
        match Session::open(deps, admission).await {
            Ok(session) => {
                if let Err(e) = session.run(socket).await {
                    debug!(error = %e, "session ended without admission");
                }
            }
            Err(e) => {
                counter!(SESSIONS_REJECTED_TOTAL, "reason" => "open").increment(1);
                warn!(error = %e, "session not opened, closing socket");
                let _ = socket.send(Message::Close(None)).await;
            }
        }
    }))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.manager.hub_count(),
        state.manager.connection_count(),
    ))
}

#[derive(Debug, Serialize)]
struct ActiveUsersResponse {
    room_id: RoomId,
    user_count: usize,
    active_users: Vec<ActiveUser>,
}

/// GET /rooms/{room_id}/active
async fn active_users_handler(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<Json<ActiveUsersResponse>, AdmissionError> {
    let active_users = state.store.list_active_users(room_id).await?;
    Ok(Json(ActiveUsersResponse {
        room_id,
        user_count: active_users.len(),
        active_users,
    }))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// A running server. Dropping it leaves the server running; call `shutdown`.
pub struct ServerHandle {
    addr: SocketAddr,
    manager: HubManager,
    coordinator: ShutdownCoordinator,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn manager(&self) -> &HubManager {
        &self.manager
    }

    /// Stop accepting, close every hub (which closes every session), then
    /// wait for the server and sweeper tasks.
    pub async fn shutdown(self) {
        self.coordinator.shutdown();
        self.manager.shutdown_all();
        self.coordinator
            .graceful_shutdown(self.tasks, self.shutdown_timeout)
            .await;
        info!("server stopped");
    }
}

/// Bind, serve, and start the hub sweeper.
pub async fn start(config: &HuddleConfig, deps: ServerDeps) -> std::io::Result<ServerHandle> {
    let state = AppState::new(config, deps);
    let manager = state.manager.clone();

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let addr = listener.local_addr()?;

    let coordinator = ShutdownCoordinator::new();
    let stop = coordinator.token();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
        {
            error!(error = %e, "server error");
        }
    });
    let sweeper = manager.spawn_sweeper(coordinator.token());

    info!(%addr, "huddle listening");
    Ok(ServerHandle {
        addr,
        manager,
        coordinator,
        tasks: vec![server, sweeper],
        shutdown_timeout: config.server.shutdown_timeout(),
    })
}
