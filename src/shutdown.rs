//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT, stops the redirector loop and gives in-flight
//! sessions a bounded amount of time to finish.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::relay::RelayEngine;
use crate::supervisor::StopHandle;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// How long in-flight sessions may keep running after a stop
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal without waiting for an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("No shutdown subscribers left");
        }
    }

    /// Wait for SIGTERM or SIGINT, then broadcast the shutdown signal
    pub async fn listen_for_signals(&self) -> Result<()> {
        debug!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Stop the redirector loop and wait for its sessions to drain.
    ///
    /// The listener is released as soon as the loop observes the stop; sessions
    /// still running when the timeout expires are left to end on their own.
    pub async fn shutdown_redirector(
        &self,
        stop: &StopHandle,
        engine: Option<&RelayEngine>,
    ) -> Result<()> {
        if stop.stop() {
            debug!("Stopped accepting new connections");
        }

        if let Some(engine) = engine {
            debug!(
                "Waiting for {} active sessions to close (timeout: {:?})",
                engine.active_sessions(),
                self.timeout
            );
            engine.wait_for_sessions_to_close(self.timeout).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RedirectConfig};
    use crate::metrics::RedirectMetrics;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_redirector_without_sessions() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(200));
        let config = Config::with_redirect(RedirectConfig::new(0, "127.0.0.1", 9));
        let engine = RelayEngine::from_config(&config, Arc::new(RedirectMetrics::new().unwrap()));
        let stop = StopHandle::new();

        coordinator
            .shutdown_redirector(&stop, Some(&engine))
            .await
            .unwrap();

        assert!(stop.is_stopped());
        assert_eq!(engine.active_sessions(), 0);
    }
}
