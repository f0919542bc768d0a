//! Redirector entry points
//!
//! [`Redirector`] picks the TCP, UDP or HTTP implementation from the
//! configured protocol and gives them one bind/run surface.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{Config, Protocol, RedirectConfig};
use crate::metrics::RedirectMetrics;
use crate::protocols::{HttpRedirector, UdpRelay};
use crate::relay::RelayEngine;
use crate::supervisor::{SessionSupervisor, StopHandle};
use crate::Result;

pub enum Redirector {
    Tcp(SessionSupervisor),
    Udp(UdpRelay),
    Http(HttpRedirector),
}

impl Redirector {
    /// Validate `config` and bind the listener for its protocol.
    ///
    /// Returns an error without leaving anything open when the listen port
    /// cannot be bound.
    pub async fn bind(config: Arc<Config>, metrics: Arc<RedirectMetrics>) -> Result<Self> {
        config.validate()?;

        Ok(match config.redirect.protocol {
            Protocol::Tcp => Redirector::Tcp(SessionSupervisor::bind(config, metrics).await?),
            Protocol::Udp => Redirector::Udp(UdpRelay::bind(config, metrics).await?),
            Protocol::Http => Redirector::Http(HttpRedirector::bind(config, metrics).await?),
        })
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Redirector::Tcp(_) => Protocol::Tcp,
            Redirector::Udp(_) => Protocol::Udp,
            Redirector::Http(_) => Protocol::Http,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Redirector::Tcp(supervisor) => supervisor.local_addr(),
            Redirector::Udp(relay) => relay.local_addr(),
            Redirector::Http(redirector) => redirector.local_addr(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        match self {
            Redirector::Tcp(supervisor) => supervisor.stop_handle(),
            Redirector::Udp(relay) => relay.stop_handle(),
            Redirector::Http(redirector) => redirector.stop_handle(),
        }
    }

    /// Relay engine of the TCP variant, used to drain sessions on shutdown
    pub fn engine(&self) -> Option<Arc<RelayEngine>> {
        match self {
            Redirector::Tcp(supervisor) => Some(supervisor.engine()),
            _ => None,
        }
    }

    /// Run until stopped
    pub async fn run(self) -> Result<()> {
        match self {
            Redirector::Tcp(mut supervisor) => supervisor.run().await,
            Redirector::Udp(relay) => relay.run().await,
            Redirector::Http(redirector) => redirector.run().await,
        }
    }
}

/// Bind on `:listen_port` and redirect to the destination until the process
/// exits.
///
/// Returns immediately with an error when the port cannot be bound; otherwise
/// this call is the accept loop and does not return under normal operation.
pub async fn start_redirector(redirect: RedirectConfig) -> Result<()> {
    let config = Arc::new(Config::with_redirect(redirect));
    let metrics = Arc::new(RedirectMetrics::new()?);

    Redirector::bind(config, metrics).await?.run().await
}
