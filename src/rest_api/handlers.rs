//! HTTP handlers for the readiness and metrics endpoints

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::controller::ControllerPhase;

use super::server::ApiState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub phase: String,
}

/// Liveness endpoint; answers as long as the process serves HTTP
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let phase = *state.phase.borrow();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        phase: format!("{phase:?}"),
    })
}

/// Readiness endpoint: 204 while the controller runs and Consul has a leader
#[instrument(skip(state))]
pub async fn ready(State(state): State<Arc<ApiState>>) -> StatusCode {
    let phase = *state.phase.borrow();
    if phase != ControllerPhase::Running {
        debug!(?phase, "Not ready: controller is not running");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    match state.registry.leader().await {
        Ok(_) => StatusCode::NO_CONTENT,
        Err(e) => {
            debug!(error = %e, "Not ready: Consul unavailable");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    crate::controller::metrics::encode_text().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
