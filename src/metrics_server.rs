//! HTTP server for the administrative surface
//!
//! Runs a lightweight HTTP server on a separate port exposing:
//!
//! - `/metrics` — Prometheus text exposition for scraping
//! - `/healthz` — JSON health report: breaker state, current offset,
//!   running flag
//!
//! # Example
//!
//! ```ignore
//! use kaiku::metrics_server::MetricsServer;
//!
//! let handle = MetricsServer::start(addr, poller.health());
//! // Later, to shutdown
//! handle.abort();
//! ```

use crate::poller::PollerHealth;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Administrative HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the server on the given address
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    /// The server runs until aborted or the process exits.
    pub fn start(addr: SocketAddr, health: Arc<PollerHealth>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let app = Router::new()
                .route("/metrics", get(metrics_handler))
                .route("/healthz", get(health_handler))
                .with_state(health);

            info!(%addr, "admin server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, %addr, "failed to bind admin server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "admin server error");
            }
        })
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /healthz endpoint
async fn health_handler(State(health): State<Arc<PollerHealth>>) -> impl IntoResponse {
    (StatusCode::OK, Json(health.report()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_handler_returns_prometheus_format() {
        // Initialize metrics first
        let _ = crate::metrics::Metrics::init();

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .expect("content type set")
            .to_str()
            .expect("ascii");
        assert!(content_type.contains("text/plain"));
    }
}
