//! Operator HTTP endpoint.
//!
//! Read access to task state and metrics, plus the manual rotation trigger.
//! Nothing served here carries credential data or key material.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use state::AppState;

/// Bind `0.0.0.0:<port>` and serve until `shutdown` fires.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind operator endpoint on {addr}"))?;
    info!(component = "ops_server", %addr, "operator endpoint listening");

    axum::serve(listener, router::build(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("operator endpoint failed")
}
