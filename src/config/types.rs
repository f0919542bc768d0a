//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub redirect: RedirectConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Transport the redirector listens on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Http => write!(f, "HTTP"),
        }
    }
}

/// What to redirect and where to.
///
/// Supplied once when the redirector starts and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RedirectConfig {
    #[serde(default)]
    pub protocol: Protocol,
    pub listen_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
    #[serde(default)]
    pub verbose: bool,
}

impl RedirectConfig {
    /// Create a TCP redirect from `listen_port` to `destination_host:destination_port`
    pub fn new(listen_port: u16, destination_host: impl Into<String>, destination_port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            listen_port,
            destination_host: destination_host.into(),
            destination_port,
            verbose: false,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Destination in `host:port` form, bracketing IPv6 literals
    pub fn destination(&self) -> String {
        if self.destination_host.contains(':') && !self.destination_host.starts_with('[') {
            format!("[{}]:{}", self.destination_host, self.destination_port)
        } else {
            format!("{}:{}", self.destination_host, self.destination_port)
        }
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            listen_port: 8888,
            destination_host: String::new(),
            destination_port: 0,
            verbose: false,
        }
    }
}

/// Listener and relay tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub accept_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub udp_idle_timeout: Duration,
    pub max_http_body_bytes: usize,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub metrics_addr: Option<SocketAddr>,
    pub log_level: String,
}

impl Config {
    /// Build a configuration around `redirect` with default server and monitoring settings
    pub fn with_redirect(redirect: RedirectConfig) -> Self {
        Self {
            redirect,
            ..Self::default()
        }
    }

    /// Address the listener binds to
    pub fn listen_addr(&self) -> String {
        let host = &self.server.bind_host;
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.redirect.listen_port)
        } else {
            format!("{}:{}", host, self.redirect.listen_port)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            buffer_size: 32 * 1024,
            connect_timeout: Duration::from_secs(10),
            accept_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            udp_idle_timeout: Duration::from_secs(60),
            max_http_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_addr: None,
            log_level: "warn".to_string(),
        }
    }
}
