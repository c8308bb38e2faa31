//! Identity for incoming connections.
//!
//! Authentication happens upstream; the gateway forwards the verified user
//! as request headers.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use huddle_core::UserId;
use huddle_store::StoreError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USERNAME_HEADER: &str = "x-username";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdmissionError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AdmissionError::Store(e) => {
                warn!(error = %e, "request failed on store");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Turns request headers into a verified identity.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AdmissionError>;
}

/// Trusts `x-user-id` / `x-username` set by the authenticating gateway.
#[derive(Clone, Copy, Debug, Default)]
pub struct GatewayHeaders;

impl Authenticator for GatewayHeaders {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AdmissionError> {
        let header = |name: &'static str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or(AdmissionError::Unauthenticated("missing x-user-id"))?
            .parse::<UserId>()
            .map_err(|_| AdmissionError::Unauthenticated("x-user-id is not an integer"))?;
        let username = header(USERNAME_HEADER)
            .ok_or(AdmissionError::Unauthenticated("missing x-username"))?
            .to_string();

        Ok(Identity { user_id, username })
    }
}
