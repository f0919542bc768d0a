//! UDP redirector
//!
//! Each client source address gets its own association: an ephemeral socket
//! connected to the destination. Datagrams from the client go out on that
//! socket unchanged; replies come back through a per-association task that
//! sends them to the client from the listening socket. Associations expire
//! after a period without traffic.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::RedirectMetrics;
use crate::relay::CloseGuard;
use crate::supervisor::StopHandle;
use crate::Result;

/// Largest UDP payload we can receive
const MAX_DATAGRAM_SIZE: usize = 65_535;

struct UdpAssociation {
    client_addr: SocketAddr,
    upstream: UdpSocket,
    last_activity: Mutex<Instant>,
    guard: CloseGuard,
}

impl UdpAssociation {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }
}

type AssociationMap = Arc<Mutex<HashMap<SocketAddr, Arc<UdpAssociation>>>>;

/// Datagram redirector bound on `bind_host:listen_port`
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    destination_addr: SocketAddr,
    config: Arc<Config>,
    metrics: Arc<RedirectMetrics>,
    associations: AssociationMap,
    stop: StopHandle,
}

impl UdpRelay {
    /// Resolve the destination and bind the listening socket; either failure
    /// is returned immediately
    pub async fn bind(config: Arc<Config>, metrics: Arc<RedirectMetrics>) -> Result<Self> {
        let destination = config.redirect.destination();
        let destination_addr = lookup_host(destination.as_str())
            .await
            .with_context(|| format!("Failed to resolve remote UDP address {}", destination))?
            .next()
            .ok_or_else(|| anyhow!("No addresses resolved for {}", destination))?;

        let listen_addr = config.listen_addr();

        lifecycle!(config.redirect.verbose, "Binding UDP socket to {}", listen_addr);
        let socket = UdpSocket::bind(listen_addr.as_str())
            .await
            .with_context(|| format!("Failed to start UDP listener on {}", listen_addr))?;
        let local_addr = socket.local_addr().context("Failed to get UDP socket address")?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            destination_addr,
            config,
            metrics,
            associations: Arc::new(Mutex::new(HashMap::new())),
            stop: StopHandle::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Destination address resolved at bind time
    pub fn destination_addr(&self) -> SocketAddr {
        self.destination_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Number of client associations currently alive
    pub fn active_associations(&self) -> usize {
        self.associations.lock().map(|map| map.len()).unwrap_or(0)
    }

    /// Receive and forward datagrams until a stop is requested
    pub async fn run(&self) -> Result<()> {
        lifecycle!(
            self.config.redirect.verbose,
            "UDP redirector started on {} -> {}",
            self.local_addr,
            self.destination_addr
        );

        let stop = self.stop.clone();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            if stop.is_stopped() {
                break;
            }

            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((n, client_addr)) => {
                            self.forward_upstream(&buffer[..n], client_addr).await;
                        }
                        Err(e) => {
                            // ICMP errors from earlier sends surface here on some platforms
                            warn!("Error reading UDP: {}", e);
                        }
                    }
                }
                _ = stop.stopped() => {
                    debug!("Stop requested, leaving UDP receive loop");
                }
            }
        }

        let associations: Vec<_> = self
            .associations
            .lock()
            .map(|mut map| map.drain().map(|(_, association)| association).collect())
            .unwrap_or_default();
        for association in associations {
            association.guard.close();
        }

        lifecycle!(
            self.config.redirect.verbose,
            "UDP redirector on {} stopped",
            self.local_addr
        );
        Ok(())
    }

    async fn forward_upstream(&self, datagram: &[u8], client_addr: SocketAddr) {
        let association = match self.association_for(client_addr).await {
            Ok(association) => association,
            Err(e) => {
                warn!(client_addr = %client_addr, "Dropping datagram: {:#}", e);
                self.metrics.dial_failed();
                return;
            }
        };

        association.touch();
        match association.upstream.send(datagram).await {
            Ok(sent) => {
                self.metrics.udp_datagram("upstream", sent);
                if self.config.redirect.verbose {
                    info!(
                        "UDP data redirected from {} -> {} ({} bytes)",
                        client_addr, self.destination_addr, sent
                    );
                }
            }
            Err(e) => {
                warn!(client_addr = %client_addr, "Error sending UDP data: {}", e);
            }
        }
    }

    async fn association_for(&self, client_addr: SocketAddr) -> Result<Arc<UdpAssociation>> {
        let existing = self
            .associations
            .lock()
            .map_err(|_| anyhow!("UDP association table poisoned"))?
            .get(&client_addr)
            .cloned();
        if let Some(association) = existing {
            return Ok(association);
        }

        let upstream = self.open_upstream().await?;
        let association = Arc::new(UdpAssociation {
            client_addr,
            upstream,
            last_activity: Mutex::new(Instant::now()),
            guard: CloseGuard::new(),
        });

        self.associations
            .lock()
            .map_err(|_| anyhow!("UDP association table poisoned"))?
            .insert(client_addr, Arc::clone(&association));
        self.metrics.session_started();
        debug!(client_addr = %client_addr, "Created UDP association");

        let task = ReplyTask {
            socket: Arc::clone(&self.socket),
            association: Arc::clone(&association),
            associations: Arc::clone(&self.associations),
            metrics: Arc::clone(&self.metrics),
            idle_timeout: self.config.server.udp_idle_timeout,
        };
        tokio::spawn(task.run());

        Ok(association)
    }

    async fn open_upstream(&self) -> Result<UdpSocket> {
        let remote = self.destination_addr;
        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let upstream = UdpSocket::bind(local)
            .await
            .context("Failed to bind upstream UDP socket")?;
        upstream
            .connect(remote)
            .await
            .with_context(|| format!("Failed to connect UDP socket to {}", remote))?;

        Ok(upstream)
    }
}

/// Relays replies for one association back to its client
struct ReplyTask {
    socket: Arc<UdpSocket>,
    association: Arc<UdpAssociation>,
    associations: AssociationMap,
    metrics: Arc<RedirectMetrics>,
    idle_timeout: Duration,
}

impl ReplyTask {
    async fn run(self) {
        let client_addr = self.association.client_addr;
        let started = Instant::now();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let idle = self.association.idle_for();
            if idle >= self.idle_timeout {
                debug!(client_addr = %client_addr, "UDP association idle for {:?}, expiring", idle);
                break;
            }

            tokio::select! {
                received = self.association.upstream.recv(&mut buffer) => {
                    match received {
                        Ok(n) => {
                            self.association.touch();
                            match self.socket.send_to(&buffer[..n], client_addr).await {
                                Ok(sent) => self.metrics.udp_datagram("downstream", sent),
                                Err(e) => warn!(client_addr = %client_addr, "Error sending UDP reply: {}", e),
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                            debug!(client_addr = %client_addr, "Destination refused UDP datagram");
                        }
                        Err(e) => {
                            warn!(client_addr = %client_addr, "Error reading UDP reply: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep(self.idle_timeout - idle) => {}
                _ = self.association.guard.closed() => break,
            }
        }

        self.association.guard.close();
        if let Ok(mut map) = self.associations.lock() {
            if map
                .get(&client_addr)
                .is_some_and(|current| Arc::ptr_eq(current, &self.association))
            {
                map.remove(&client_addr);
            }
        }
        self.metrics.session_ended(started.elapsed(), 0, 0);
    }
}
