//! Axum HTTP server for the readiness and metrics endpoints

use std::future::Future;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::consul::MeshRegistry;
use crate::controller::ControllerPhase;
use crate::{Error, Result};

use super::handlers;

/// State shared with the HTTP handlers
pub struct ApiState {
    pub phase: watch::Receiver<ControllerPhase>,
    pub registry: Arc<dyn MeshRegistry>,
}

impl ApiState {
    pub fn new(phase: watch::Receiver<ControllerPhase>, registry: Arc<dyn MeshRegistry>) -> Self {
        Self { phase, registry }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/health/ready", get(handlers::ready));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(handlers::metrics));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: Arc<ApiState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Readiness server listening on {}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))
}
