//! Session Supervisor Module
//! 
//! Owns the listening socket and keeps the accept loop alive, handing every
//! accepted connection to the relay engine.

pub mod acceptor;
pub mod manager;

pub use acceptor::Acceptor;
pub use manager::{SessionSupervisor, StopHandle, SupervisorState};
