//! API request handlers

use super::responses::*;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use swarmveil_core::{TunnelNode, TunnelStatus};
use tracing::{debug, error};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<TunnelNode>,
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /api/status — the full node snapshot
pub async fn get_status(State(state): State<AppState>) -> Json<TunnelStatus> {
    debug!("GET /api/status");
    Json(state.node.status().await)
}

/// GET /api/peers
pub async fn get_peers(State(state): State<AppState>) -> Json<PeersResponse> {
    debug!("GET /api/peers");
    let peers = state.node.status().await.peers;
    Json(PeersResponse {
        total: peers.total,
        discovered: peers.discovered,
        in_progress: peers.in_progress,
        verified: peers.verified,
        lost: peers.lost,
    })
}

/// GET /api/circuits
pub async fn get_circuits(State(state): State<AppState>) -> Json<CircuitsResponse> {
    debug!("GET /api/circuits");
    let status = state.node.status().await;
    Json(CircuitsResponse {
        total: status.circuits.total,
        creating: status.circuits.creating,
        established: status.circuits.established,
        failed: status.circuits.failed,
        bytes_sent: status.circuits.bytes_sent,
        bytes_received: status.circuits.bytes_received,
        relayed: status.relayed_circuits,
    })
}

/// GET /api/contribution
pub async fn get_contribution(State(state): State<AppState>) -> Json<ContributionResponse> {
    debug!("GET /api/contribution");
    let contribution = state.node.status().await.contribution;
    Json(ContributionResponse {
        relayed_bytes: contribution.relayed.as_bytes(),
        consumed_bytes: contribution.consumed.as_bytes(),
        ratio: contribution.ratio,
    })
}

/// Application error type
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.message);
        let body = Json(ErrorResponse::new(self.message, self.status_code.as_u16()));
        (self.status_code, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
