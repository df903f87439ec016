use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::AppState;
use crate::handlers::monitoring;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(monitoring::metrics))
        .route("/healthz", get(monitoring::healthz))
        .route("/root-cert", get(monitoring::root_cert))
        .with_state(state)
}

/// Serve the monitoring endpoints on `listener` until `cancel` fires.
pub async fn start_monitoring_server(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!("Starting monitoring server on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("Monitoring server stopped");
    Ok(())
}
