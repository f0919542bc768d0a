//! Protocol Variants
//! 
//! Datagram and HTTP redirectors that follow the same bind-then-run shape as
//! the TCP supervisor.

pub mod http;
pub mod udp;

pub use http::HttpRedirector;
pub use udp::UdpRelay;
