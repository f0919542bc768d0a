//! Listener abstraction used by the accept loop

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Source of inbound connections for a [`SessionSupervisor`](super::SessionSupervisor)
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// Wait for the next inbound connection
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    /// Address the acceptor is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}
