//! Metrics Collector

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tracing::error;

/// Prometheus counters shared by every redirector task.
///
/// Each instance owns its own registry, so several redirectors (or tests) can
/// run side by side in one process.
pub struct RedirectMetrics {
    registry: Registry,

    sessions_total: IntCounter,
    active_sessions: IntGauge,
    dial_failures_total: IntCounter,
    accept_errors_total: IntCounter,
    unexpected_io_errors_total: IntCounter,
    bytes_total: IntCounterVec,
    session_duration: Histogram,
    udp_datagrams_total: IntCounterVec,
    http_requests_total: IntCounterVec,
}

impl RedirectMetrics {
    /// Create a new metrics collector
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "redirect_sessions_total",
            "Total number of relay sessions started",
        )?;
        let active_sessions = IntGauge::new(
            "redirect_active_sessions",
            "Number of relay sessions currently running",
        )?;
        let dial_failures_total = IntCounter::new(
            "redirect_dial_failures_total",
            "Failed attempts to connect to the destination",
        )?;
        let accept_errors_total = IntCounter::new(
            "redirect_accept_errors_total",
            "Transient errors returned by accept",
        )?;
        let unexpected_io_errors_total = IntCounter::new(
            "redirect_unexpected_io_errors_total",
            "Relay I/O errors that were not a normal connection teardown",
        )?;
        let bytes_total = IntCounterVec::new(
            Opts::new("redirect_bytes_total", "Bytes relayed, by direction"),
            &["direction"],
        )?;
        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "redirect_session_duration_seconds",
                "Lifetime of relay sessions in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 3600.0]),
        )?;
        let udp_datagrams_total = IntCounterVec::new(
            Opts::new("redirect_udp_datagrams_total", "UDP datagrams relayed, by direction"),
            &["direction"],
        )?;
        let http_requests_total = IntCounterVec::new(
            Opts::new("redirect_http_requests_total", "HTTP requests forwarded, by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(dial_failures_total.clone()))?;
        registry.register(Box::new(accept_errors_total.clone()))?;
        registry.register(Box::new(unexpected_io_errors_total.clone()))?;
        registry.register(Box::new(bytes_total.clone()))?;
        registry.register(Box::new(session_duration.clone()))?;
        registry.register(Box::new(udp_datagrams_total.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            active_sessions,
            dial_failures_total,
            accept_errors_total,
            unexpected_io_errors_total,
            bytes_total,
            session_duration,
            udp_datagrams_total,
            http_requests_total,
        })
    }

    pub fn session_started(&self) {
        self.sessions_total.inc();
        self.active_sessions.inc();
    }

    /// Record a finished session and the bytes it moved
    pub fn session_ended(&self, duration: Duration, bytes_up: u64, bytes_down: u64) {
        self.active_sessions.dec();
        self.session_duration.observe(duration.as_secs_f64());
        self.bytes_total.with_label_values(&["upstream"]).inc_by(bytes_up);
        self.bytes_total.with_label_values(&["downstream"]).inc_by(bytes_down);
    }

    pub fn dial_failed(&self) {
        self.dial_failures_total.inc();
    }

    pub fn accept_failed(&self) {
        self.accept_errors_total.inc();
    }

    pub fn unexpected_io_error(&self) {
        self.unexpected_io_errors_total.inc();
    }

    /// Count one UDP datagram; `direction` is `upstream` or `downstream`
    pub fn udp_datagram(&self, direction: &str, bytes: usize) {
        self.udp_datagrams_total.with_label_values(&[direction]).inc();
        self.bytes_total
            .with_label_values(&[direction])
            .inc_by(bytes as u64);
    }

    /// Count one forwarded HTTP request; `outcome` is `forwarded` or `failed`
    pub fn http_request(&self, outcome: &str) {
        self.http_requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn total_sessions(&self) -> u64 {
        self.sessions_total.get()
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures_total.get()
    }

    pub fn accept_errors(&self) -> u64 {
        self.accept_errors_total.get()
    }

    pub fn unexpected_io_errors(&self) -> u64 {
        self.unexpected_io_errors_total.get()
    }

    pub fn bytes_relayed(&self, direction: &str) -> u64 {
        self.bytes_total.with_label_values(&[direction]).get()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }
}
