//! Prometheus metrics exposition
//!
//! The libraries emit through the `metrics` facade:
//!
//! - `chat_token_renewals_total` (counter): label `outcome`
//! - `chat_requests_total` (counter): label `status`
//! - `chat_reconnects_scheduled_total` (counter): label `reason`
//! - `chat_frames_dropped_total` (counter): label `reason`
//! - `chat_messages_received_total`, `chat_messages_sent_total` (counters)
//! - `chat_connection_state` (gauge): 0 disconnected, 1 connecting, 2 connected
//!
//! Without a recorder every call is a no-op; the binary installs one only
//! when `[metrics] listen_addr` is configured.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Install the global Prometheus recorder.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle)
}

/// Serve `/metrics` on `addr` in the background.
pub async fn serve(addr: SocketAddr, handle: PrometheusHandle) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics listener started");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(handle)).await {
            error!(error = %e, "metrics listener failed");
        }
    });
    Ok(())
}

/// Prometheus text exposition endpoint.
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
