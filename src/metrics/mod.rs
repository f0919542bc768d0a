//! Prometheus counters for sessions, failures and relayed bytes, plus the
//! optional HTTP endpoint that exposes them.

pub mod collector;
pub mod server;

pub use collector::RedirectMetrics;
pub use server::MetricsServer;
