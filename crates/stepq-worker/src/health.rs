//! Minimal HTTP liveness endpoint, run as the supervisor's health-check
//! subprocess.

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

pub fn router() -> Router {
    Router::new().route("/healthcheck", get(healthcheck))
}

/// GET /healthcheck
async fn healthcheck() -> &'static str {
    "ok"
}

/// Bind `host:port` and serve until `shutdown` is cancelled.
pub async fn serve(host: &str, port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    serve_on(listener, shutdown).await
}

pub async fn serve_on(listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    info!(addr = %listener.local_addr()?, "health-check server listening");
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("health-check server stopped");
    Ok(())
}
