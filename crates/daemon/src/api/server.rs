//! API server

use super::handlers::{
    get_circuits, get_contribution, get_peers, get_status, health_check, AppState,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use swarmveil_core::TunnelNode;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Serves the read-only status endpoints
pub struct ApiServer {
    listen_addr: SocketAddr,
    node: Arc<TunnelNode>,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, node: Arc<TunnelNode>) -> Self {
        Self { listen_addr, node }
    }

    pub async fn start(self) -> Result<()> {
        let state = AppState { node: self.node };

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/api/status", get(get_status))
            .route("/api/peers", get(get_peers))
            .route("/api/circuits", get(get_circuits))
            .route("/api/contribution", get(get_contribution))
            // Local dashboards run in browsers; allow them in.
            .layer(CorsLayer::permissive())
            .with_state(state);

        info!("API server listening on {}", self.listen_addr);
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|err| anyhow::anyhow!("API server error: {err}"))?;

        Ok(())
    }
}
