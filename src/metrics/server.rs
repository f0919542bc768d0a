//! Metrics HTTP Server
//!
//! Provides HTTP endpoint for Prometheus metrics scraping

use crate::metrics::RedirectMetrics;
use anyhow::Context;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// HTTP server for serving Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<RedirectMetrics>,
    bind_addr: SocketAddr,
}

impl MetricsServer {
    /// Create a new metrics server
    pub fn new(metrics: Arc<RedirectMetrics>, bind_addr: SocketAddr) -> Self {
        Self { metrics, bind_addr }
    }

    /// Bind and serve until the task is dropped
    pub async fn start(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server on {}", self.bind_addr))?;
        info!(bind_addr = %self.bind_addr, "Metrics server started");

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        axum::serve(listener, router(self.metrics))
            .await
            .context("Metrics server failed")
    }
}

fn router(metrics: Arc<RedirectMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<RedirectMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.export_prometheus(),
    )
}
