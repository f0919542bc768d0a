//! Session Supervisor Implementation

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::Acceptor;
use crate::config::Config;
use crate::metrics::RedirectMetrics;
use crate::relay::{CloseGuard, RelayEngine};
use crate::Result;

/// Lifecycle of the accept loop, published through [`SessionSupervisor::subscribe_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Bound, loop not started yet
    Idle,
    /// Bound and running, between accept attempts (handing off or backing off)
    Listening,
    /// Waiting in accept for the next connection
    Accepting,
    /// Loop ended and listener released
    Stopped,
}

/// Cloneable handle that ends a running redirector loop.
///
/// Stopping is idempotent and may happen before the loop starts, in which
/// case the loop exits on its first iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    guard: CloseGuard,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the loop to stop. Returns `true` for the first request.
    pub fn stop(&self) -> bool {
        self.guard.close()
    }

    pub fn is_stopped(&self) -> bool {
        self.guard.is_closed()
    }

    /// Resolve once a stop was requested
    pub async fn stopped(&self) {
        self.guard.closed().await
    }
}

/// Owns the listener and dispatches each accepted connection to the relay engine
pub struct SessionSupervisor<A: Acceptor = TcpListener> {
    acceptor: Option<A>,
    local_addr: SocketAddr,
    config: Arc<Config>,
    engine: Arc<RelayEngine>,
    metrics: Arc<RedirectMetrics>,
    state: watch::Sender<SupervisorState>,
    stop: StopHandle,
}

impl SessionSupervisor<TcpListener> {
    /// Bind the listener on `bind_host:listen_port`.
    ///
    /// A bind failure is returned as is; nothing stays open on that path.
    pub async fn bind(config: Arc<Config>, metrics: Arc<RedirectMetrics>) -> Result<Self> {
        let listen_addr = config.listen_addr();

        lifecycle!(config.redirect.verbose, "Binding TCP listener to {}", listen_addr);
        let listener = TcpListener::bind(listen_addr.as_str())
            .await
            .with_context(|| format!("Failed to start TCP listener on {}", listen_addr))?;

        Self::with_acceptor(listener, config, metrics)
    }
}

impl<A: Acceptor> SessionSupervisor<A> {
    /// Build a supervisor around an already bound acceptor
    pub fn with_acceptor(
        acceptor: A,
        config: Arc<Config>,
        metrics: Arc<RedirectMetrics>,
    ) -> Result<Self> {
        let local_addr = acceptor
            .local_addr()
            .context("Failed to get listener address")?;
        let engine = Arc::new(RelayEngine::from_config(&config, Arc::clone(&metrics)));

        Ok(Self {
            acceptor: Some(acceptor),
            local_addr,
            config,
            engine,
            metrics,
            state: watch::Sender::new(SupervisorState::Idle),
            stop: StopHandle::new(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> Arc<RelayEngine> {
        Arc::clone(&self.engine)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Follow state changes while `run` owns the supervisor
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Run the accept loop until a stop is requested.
    ///
    /// Accept errors are logged, followed by a fixed pause before the next
    /// attempt. Each accepted connection is handed to its own task, so a slow
    /// dial never holds up the next accept. The listener is dropped when the
    /// loop exits; in-flight sessions keep running.
    pub async fn run(&mut self) -> Result<()> {
        let acceptor = self
            .acceptor
            .take()
            .ok_or_else(|| anyhow!("Supervisor listener already consumed"))?;
        let stop = self.stop.clone();
        let backoff = self.config.server.accept_backoff;

        self.state.send_replace(SupervisorState::Listening);
        lifecycle!(
            self.config.redirect.verbose,
            "TCP redirector started on {} -> {}",
            self.local_addr,
            self.engine.destination()
        );

        loop {
            if stop.is_stopped() {
                break;
            }

            self.state.send_replace(SupervisorState::Accepting);
            tokio::select! {
                accepted = acceptor.accept() => {
                    self.state.send_replace(SupervisorState::Listening);
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);

                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                engine.handle_inbound(stream, addr).await;
                            });
                        }
                        Err(e) => {
                            warn!("Error accepting connection: {} (retrying in {:?})", e, backoff);
                            self.metrics.accept_failed();

                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = stop.stopped() => {}
                            }
                        }
                    }
                }
                _ = stop.stopped() => {
                    debug!("Stop requested, leaving accept loop");
                }
            }
        }

        drop(acceptor);
        self.state.send_replace(SupervisorState::Stopped);
        lifecycle!(
            self.config.redirect.verbose,
            "TCP redirector on {} stopped",
            self.local_addr
        );

        Ok(())
    }
}
