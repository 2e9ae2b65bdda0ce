//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{error, instrument};

use crate::controller::ControllerState;

use super::dto::{ErrorResponse, HealthResponse, NetworkListResponse, NetworkSummary};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader.load(Ordering::Relaxed),
    })
}

/// Metrics endpoint in the OpenMetrics text format
pub async fn metrics() -> Result<String, ApiError> {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("encode_failed", &e.to_string())),
        )
    })?;
    Ok(buffer)
}

/// List all Networks with their participation summary
#[instrument(skip(state))]
pub async fn list_networks(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<NetworkListResponse>, ApiError> {
    match state.ctx.store.list_networks(None).await {
        Ok(networks) => {
            let items: Vec<NetworkSummary> = networks.iter().map(NetworkSummary::from).collect();
            let total = items.len();
            Ok(Json(NetworkListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list networks: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Get a specific Network
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_network(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<NetworkSummary>, ApiError> {
    match state.ctx.store.get_network(&namespace, &name).await {
        Ok(Some(network)) => Ok(Json(NetworkSummary::from(&network))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("Network {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get network {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}
