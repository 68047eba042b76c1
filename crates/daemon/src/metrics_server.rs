//! Metrics HTTP Server for transcoderd
//!
//! Read-only JSON view of the metrics snapshot for dashboards and monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use log::info;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid metrics address {0:?}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics endpoint
/// Returns the current MetricsSnapshot as JSON
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Parses the configured listen address, e.g. `127.0.0.1:7878`.
pub fn parse_metrics_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    addr.trim()
        .parse()
        .map_err(|_| ServerError::InvalidAddress(addr.to_string()))
}

/// Runs the metrics HTTP server until `shutdown` resolves
///
/// # Arguments
/// * `metrics` - Shared metrics state to serve
/// * `addr` - Listen address
/// * `shutdown` - Graceful shutdown signal
pub async fn run_metrics_server<F>(
    metrics: SharedMetrics,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics endpoint listening on http://{}/metrics", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
