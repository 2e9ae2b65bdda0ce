//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::{Error, Result};

use super::handlers;

pub fn router(state: Arc<ControllerState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/networks", get(handlers::list_networks))
        .route(
            "/api/v1/networks/{namespace}/{name}",
            get(handlers::get_network),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the REST API server
pub async fn run_server(state: Arc<ControllerState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("REST API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
