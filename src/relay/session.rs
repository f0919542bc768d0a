//! Relay Session

use super::guard::CloseGuard;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One client endpoint paired with one destination endpoint.
///
/// The sockets themselves are owned by the two copy tasks; the session holds
/// what both directions share: counters and the close-once guard.
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    directions_open: AtomicUsize,
    guard: CloseGuard,
}

/// Statistics of a session, taken when it ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(session_id: String, client_addr: SocketAddr, server_addr: SocketAddr) -> Self {
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, client_addr, server_addr
        );

        Self {
            session_id,
            client_addr,
            server_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            directions_open: AtomicUsize::new(2),
            guard: CloseGuard::new(),
        }
    }

    /// Bytes copied client -> destination
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes copied destination -> client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Tear the session down. Safe to call from both directions; returns
    /// `true` only for the first caller.
    pub fn close(&self) -> bool {
        self.guard.close()
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// Resolve once either direction has closed the session
    pub async fn closed(&self) {
        self.guard.closed().await
    }

    /// Mark one copy direction as finished. Returns `true` for the last one,
    /// which owns the final bookkeeping.
    pub fn direction_finished(&self) -> bool {
        self.directions_open.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn to_stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            server_addr: self.server_addr,
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Log session statistics; lifecycle messages are INFO only when verbose
    pub fn log_stats(&self, verbose: bool) {
        let stats = self.to_stats();
        if verbose {
            info!(
                session_id = %stats.session_id,
                client_addr = %stats.client_addr,
                server_addr = %stats.server_addr,
                duration_ms = stats.duration_ms,
                bytes_up = stats.bytes_up,
                bytes_down = stats.bytes_down,
                "Session {} closed: {} -> {} | Up: {} bytes | Down: {} bytes",
                stats.session_id,
                stats.client_addr,
                stats.server_addr,
                stats.bytes_up,
                stats.bytes_down
            );
        } else {
            debug!(
                session_id = %stats.session_id,
                duration_ms = stats.duration_ms,
                total_bytes = stats.total_bytes,
                "Relay session closed"
            );
        }
    }
}
