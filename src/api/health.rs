//! Health check endpoints

use super::{ApiResponse, ApiState};
use axum::{extract::State, response::Json};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Configured network
    pub network: String,
    /// Negotiations currently pending
    pub pending_negotiations: usize,
    /// Receiver coins currently reserved
    pub locked_coins: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> Json<ApiResponse<HealthResponse>> {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        network: state.app.config.node.network.clone(),
        pending_negotiations: state.app.negotiator.pending_count(),
        locked_coins: state.app.locks.len(),
    };

    Json(ApiResponse::success(response))
}
