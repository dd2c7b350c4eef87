//! Server side of the pairing exchange
//!
//! Answers the peer operator with the ready replicas this cluster has
//! published in the endpoint registry.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use tracing::{debug, warn};

use super::{PairRequest, PairResponse, PeerEndpoint, PAIR_PATH};
use crate::registry::EndpointRegistry;
use crate::Error;

/// Liveness path of the peer server
pub const HEALTH_PATH: &str = "/healthz";

/// Shared state of the peer server
#[derive(Clone)]
pub struct PeerState {
    /// Registry holding this cluster's ready replicas
    pub registry: Arc<EndpointRegistry>,
    /// Namespace whose FLApps are served
    pub namespace: String,
}

/// Error returned to the peer operator
#[derive(Debug)]
pub enum PeerApiError {
    /// Request was malformed
    BadRequest(String),
    /// Registry could not be read
    Unavailable(String),
}

impl From<Error> for PeerApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(msg) => Self::BadRequest(msg),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl IntoResponse for PeerApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

async fn pair_handler(
    State(state): State<PeerState>,
    Json(request): Json<PairRequest>,
) -> Result<Json<PairResponse>, PeerApiError> {
    if request.app.is_empty() {
        return Err(PeerApiError::BadRequest("app must not be empty".into()));
    }
    request.replica_type.validate()?;

    debug!(
        app = %request.app,
        replica_type = %request.replica_type,
        remote = request.local.len(),
        "pairing request received"
    );

    let entries = state
        .registry
        .list_group(&state.namespace, &request.app, &request.replica_type)
        .await
        .map_err(|e| {
            warn!(app = %request.app, error = %e, "registry unavailable for pairing request");
            PeerApiError::from(e)
        })?;

    let local = entries
        .into_iter()
        .map(|(key, address)| PeerEndpoint::new(key.identifier(), address))
        .collect();

    Ok(Json(PairResponse {
        app: request.app,
        replica_type: request.replica_type,
        local,
    }))
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Create the peer router
///
/// Routes:
/// - `POST /api/v1/pair` - exchange ready replicas of one group
/// - `GET /healthz` - liveness
pub fn peer_router(state: PeerState) -> axum::Router {
    axum::Router::new()
        .route(PAIR_PATH, post(pair_handler))
        .route(HEALTH_PATH, get(health_handler))
        .with_state(state)
}
