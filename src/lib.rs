//! Portredir Library
//!
//! Transparent port redirector: accepts connections (or datagrams) on a local
//! port and relays their bytes unmodified to a single fixed destination.
//!
//! The TCP path is split into a [`relay::RelayEngine`], which dials the
//! destination and runs the bidirectional copy for one session, and a
//! [`supervisor::SessionSupervisor`], which owns the listener and keeps the
//! accept loop alive. UDP and HTTP variants live under [`protocols`].

/// Lifecycle log line: INFO when `verbose` is set, DEBUG otherwise.
///
/// WARN and ERROR go through the plain `tracing` macros and are never gated.
macro_rules! lifecycle {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

pub mod config;
pub mod metrics;
pub mod protocols;
pub mod redirector;
pub mod relay;
pub mod shutdown;
pub mod supervisor;

pub use config::{Config, Protocol, RedirectConfig};
pub use redirector::{start_redirector, Redirector};
pub use relay::RelayEngine;
pub use shutdown::ShutdownCoordinator;
pub use supervisor::{SessionSupervisor, StopHandle};

/// Common error type for the redirector
pub type Result<T> = anyhow::Result<T>;
