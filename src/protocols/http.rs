//! HTTP redirector
//!
//! Terminates HTTP on the listen port and re-issues every request to the
//! destination, copying method, path, query, headers and body. The response
//! status and headers are copied back and the body is streamed through.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::RedirectMetrics;
use crate::supervisor::StopHandle;
use crate::Result;

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP_HEADERS: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
];

#[derive(Clone)]
struct HttpState {
    client: reqwest::Client,
    base_url: Arc<str>,
    max_body_bytes: usize,
    verbose: bool,
    metrics: Arc<RedirectMetrics>,
}

/// HTTP redirector bound on `bind_host:listen_port`
pub struct HttpRedirector {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: HttpState,
    stop: StopHandle,
}

impl HttpRedirector {
    /// Bind the listener and build the upstream client; a bind failure is
    /// returned immediately
    pub async fn bind(config: Arc<Config>, metrics: Arc<RedirectMetrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.server.connect_timeout)
            .pool_max_idle_per_host(0)
            .no_proxy()
            .build()
            .context("Failed to build HTTP client")?;

        let listen_addr = config.listen_addr();
        lifecycle!(config.redirect.verbose, "Binding HTTP listener to {}", listen_addr);
        let listener = TcpListener::bind(listen_addr.as_str())
            .await
            .with_context(|| format!("Failed to start HTTP listener on {}", listen_addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to get listener address")?;

        let state = HttpState {
            client,
            base_url: format!("http://{}", config.redirect.destination()).into(),
            max_body_bytes: config.server.max_http_body_bytes,
            verbose: config.redirect.verbose,
            metrics,
        };

        Ok(Self {
            listener,
            local_addr,
            state,
            stop: StopHandle::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Serve until a stop is requested
    pub async fn run(self) -> Result<()> {
        lifecycle!(
            self.state.verbose,
            "HTTP redirector started on {} -> {}",
            self.local_addr,
            self.state.base_url
        );

        let verbose = self.state.verbose;
        let app = Router::new()
            .fallback(forward_request)
            .with_state(self.state);
        let stop = self.stop;

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { stop.stopped().await })
            .await
            .context("HTTP redirector failed")?;

        lifecycle!(verbose, "HTTP redirector on {} stopped", self.local_addr);
        Ok(())
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

async fn forward_request(State(state): State<HttpState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.base_url, path_and_query);

    let body: Bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read request body for {}: {}", url, e);
            state.metrics.http_request("failed");
            return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
        }
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let upstream = state
        .client
        .request(parts.method.clone(), url.as_str())
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Failed to connect to destination {}: {}", url, e);
            state.metrics.http_request("failed");
            return (StatusCode::BAD_GATEWAY, "Failed to connect to destination").into_response();
        }
    };

    if state.verbose {
        info!("HTTP {} {} -> {}", parts.method, url, upstream.status());
    }
    state.metrics.http_request("forwarded");

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}
