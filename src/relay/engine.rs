//! Relay Engine

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::RelaySession;
use crate::config::Config;
use crate::metrics::RedirectMetrics;
use crate::Result;

/// How a relay I/O error should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The normal way a connection ends (reset, broken pipe, closed socket)
    BenignTeardown,
    /// Anything else; reported at warning level
    Unexpected,
}

/// Classify an I/O error raised while copying between the two endpoints
pub fn classify_io_error(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => ErrorClass::BenignTeardown,
        _ => ErrorClass::Unexpected,
    }
}

/// Copy direction within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to destination
    Upstream,
    /// Destination to client
    Downstream,
}

impl Direction {
    fn record(self, session: &RelaySession, bytes: u64) {
        match self {
            Direction::Upstream => session.add_bytes_up(bytes),
            Direction::Downstream => session.add_bytes_down(bytes),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "upstream"),
            Direction::Downstream => write!(f, "downstream"),
        }
    }
}

/// Dials the destination for each inbound connection and runs the
/// bidirectional copy between them
pub struct RelayEngine {
    destination: String,
    buffer_size: usize,
    connect_timeout: Duration,
    verbose: bool,
    metrics: Arc<RedirectMetrics>,
    active_sessions: AtomicUsize,
}

impl RelayEngine {
    /// Create a new relay engine from configuration
    pub fn from_config(config: &Config, metrics: Arc<RedirectMetrics>) -> Self {
        Self {
            destination: config.redirect.destination(),
            buffer_size: config.server.buffer_size.max(1),
            connect_timeout: config.server.connect_timeout,
            verbose: config.redirect.verbose,
            metrics,
            active_sessions: AtomicUsize::new(0),
        }
    }

    /// Destination in `host:port` form
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Open a single outbound connection to the destination. No retry.
    pub async fn connect_destination(&self) -> Result<TcpStream> {
        debug!("Connecting to destination {}", self.destination);

        match timeout(self.connect_timeout, TcpStream::connect(self.destination.as_str())).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(anyhow::Error::new(e)
                .context(format!("Failed to connect to destination {}", self.destination))),
            Err(_) => Err(anyhow!(
                "Connection to destination {} timed out after {:?}",
                self.destination,
                self.connect_timeout
            )),
        }
    }

    /// Full pipeline for one accepted connection: dial, then relay.
    ///
    /// When the dial fails the inbound connection is closed right away and the
    /// failure is logged; no session is created.
    pub async fn handle_inbound(
        self: &Arc<Self>,
        client: TcpStream,
        client_addr: SocketAddr,
    ) -> Option<Arc<RelaySession>> {
        let server = match self.connect_destination().await {
            Ok(server) => server,
            Err(e) => {
                error!(
                    client_addr = %client_addr,
                    destination = %self.destination,
                    "Failed to connect to destination: {:#}", e
                );
                self.metrics.dial_failed();
                drop(client);
                return None;
            }
        };

        match self.run_session(client, server) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(client_addr = %client_addr, "Session not started: {:#}", e);
                None
            }
        }
    }

    /// Start relaying between `client` and `server`.
    ///
    /// Spawns one copy task per direction and returns immediately. Whichever
    /// task finishes first closes the session, which releases the other one;
    /// both sockets are closed once both tasks have dropped their halves.
    pub fn run_session(
        self: &Arc<Self>,
        client: TcpStream,
        server: TcpStream,
    ) -> Result<Arc<RelaySession>> {
        let client_addr = client.peer_addr().context("Failed to get client address")?;
        let server_addr = server
            .peer_addr()
            .context("Failed to get destination address")?;

        let session = Arc::new(RelaySession::new(
            Uuid::new_v4().to_string(),
            client_addr,
            server_addr,
        ));

        self.active_sessions.fetch_add(1, Ordering::AcqRel);
        self.metrics.session_started();

        lifecycle!(
            self.verbose,
            session_id = %session.session_id,
            "Redirecting {} -> {}", client_addr, server_addr
        );

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        let engine = Arc::clone(self);
        let upstream = Arc::clone(&session);
        tokio::spawn(async move {
            engine
                .copy_direction(Direction::Upstream, client_read, server_write, upstream)
                .await;
        });

        let engine = Arc::clone(self);
        let downstream = Arc::clone(&session);
        tokio::spawn(async move {
            engine
                .copy_direction(Direction::Downstream, server_read, client_write, downstream)
                .await;
        });

        Ok(session)
    }

    async fn copy_direction<R, W>(
        &self,
        direction: Direction,
        mut reader: R,
        mut writer: W,
        session: Arc<RelaySession>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let outcome = tokio::select! {
            result = copy_chunks(&mut reader, &mut writer, self.buffer_size, |n| direction.record(&session, n)) => Some(result),
            _ = session.closed() => None,
        };

        session.close();

        match outcome {
            Some(Ok(bytes)) => {
                debug!(
                    session_id = %session.session_id,
                    "{} reached end of stream after {} bytes", direction, bytes
                );
            }
            Some(Err(e)) => match classify_io_error(&e) {
                ErrorClass::BenignTeardown => {
                    debug!(
                        session_id = %session.session_id,
                        "{} closed by peer: {}", direction, e
                    );
                }
                ErrorClass::Unexpected => {
                    warn!(
                        session_id = %session.session_id,
                        client_addr = %session.client_addr,
                        "Unexpected I/O error while relaying {}: {}", direction, e
                    );
                    self.metrics.unexpected_io_error();
                }
            },
            None => {
                debug!(
                    session_id = %session.session_id,
                    "{} stopped, session closed by the other direction", direction
                );
            }
        }

        let _ = writer.shutdown().await;
        drop(writer);
        drop(reader);

        if session.direction_finished() {
            self.active_sessions.fetch_sub(1, Ordering::AcqRel);
            self.metrics
                .session_ended(session.duration(), session.bytes_up(), session.bytes_down());
            session.log_stats(self.verbose);
        }
    }

    /// Number of sessions with at least one copy direction still running
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Wait until every session has ended or `limit` elapses.
    /// Returns `true` if all sessions drained.
    pub async fn wait_for_sessions_to_close(&self, limit: Duration) -> bool {
        let start_time = Instant::now();

        while self.active_sessions() > 0 && start_time.elapsed() < limit {
            debug!("Waiting for {} active sessions to close", self.active_sessions());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.active_sessions();
        if remaining == 0 {
            lifecycle!(self.verbose, "All sessions closed in {:?}", start_time.elapsed());
            true
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                start_time.elapsed(),
                remaining
            );
            false
        }
    }
}

/// Stream bytes from `reader` to `writer` in `buffer_size` chunks until end of
/// stream or error. Returns the number of bytes copied.
async fn copy_chunks<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    mut on_chunk: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buffer = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            writer.flush().await?;
            return Ok(total);
        }
        writer.write_all(&buffer[..n]).await?;
        total += n as u64;
        on_chunk(n as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedirectConfig;

    #[test]
    fn test_benign_teardown_classification() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = io::Error::new(kind, "teardown");
            assert_eq!(classify_io_error(&err), ErrorClass::BenignTeardown, "{:?}", kind);
        }
    }

    #[test]
    fn test_unexpected_classification() {
        for kind in [
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::TimedOut,
            io::ErrorKind::Other,
        ] {
            let err = io::Error::new(kind, "fault");
            assert_eq!(classify_io_error(&err), ErrorClass::Unexpected, "{:?}", kind);
        }
    }

    #[tokio::test]
    async fn test_copy_chunks_preserves_bytes_and_order() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let (mut source_tx, mut source_rx) = tokio::io::duplex(1024);
        let (mut sink_tx, mut sink_rx) = tokio::io::duplex(64 * 1024);

        let writer_payload = payload.clone();
        let producer = tokio::spawn(async move {
            source_tx.write_all(&writer_payload).await.unwrap();
        });

        let mut chunks = 0;
        let copied = copy_chunks(&mut source_rx, &mut sink_tx, 1024, |_| chunks += 1)
            .await
            .unwrap();
        producer.await.unwrap();
        drop(sink_tx);

        let mut received = Vec::new();
        sink_rx.read_to_end(&mut received).await.unwrap();

        assert_eq!(copied, payload.len() as u64);
        assert_eq!(received, payload);
        assert!(chunks >= payload.len() / 1024);
    }

    #[tokio::test]
    async fn test_copy_chunks_flushes_each_read() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"world")
            .build();
        let mut writer = Vec::new();

        let mut sizes = Vec::new();
        let copied = copy_chunks(&mut reader, &mut writer, 4096, |n| sizes.push(n))
            .await
            .unwrap();

        assert_eq!(copied, 11);
        assert_eq!(sizes, vec![6, 5]);
        assert_eq!(writer, b"hello world");
    }

    #[tokio::test]
    async fn test_copy_chunks_surfaces_reset() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
            .build();
        let mut writer = Vec::new();

        let err = copy_chunks(&mut reader, &mut writer, 4096, |_| {})
            .await
            .unwrap_err();

        assert_eq!(classify_io_error(&err), ErrorClass::BenignTeardown);
        assert_eq!(writer, b"partial");
    }

    #[tokio::test]
    async fn test_unexpected_error_closes_session_and_counts() {
        let metrics = Arc::new(RedirectMetrics::new().unwrap());
        let config = Config::with_redirect(RedirectConfig::new(0, "127.0.0.1", 9));
        let engine = RelayEngine::from_config(&config, Arc::clone(&metrics));
        let session = Arc::new(RelaySession::new(
            "unexpected".to_string(),
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        ));

        let reader = tokio_test::io::Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            .build();
        let writer = Vec::new();

        engine
            .copy_direction(Direction::Upstream, reader, writer, Arc::clone(&session))
            .await;

        assert!(session.is_closed());
        assert_eq!(session.bytes_up(), 3);
        assert_eq!(metrics.unexpected_io_errors(), 1);
    }

    #[tokio::test]
    async fn test_connect_destination_reports_refused() {
        // Grab a free port and release it so nothing is listening there.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config::with_redirect(RedirectConfig::new(0, "127.0.0.1", port));
        let engine = RelayEngine::from_config(&config, Arc::new(RedirectMetrics::new().unwrap()));

        let err = engine.connect_destination().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to connect to destination"));
    }
}
