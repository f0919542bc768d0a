//! Data Relay Module
//! 
//! Handles bidirectional data relay between client and destination.

pub mod engine;
pub mod guard;
pub mod session;

pub use engine::{classify_io_error, Direction, ErrorClass, RelayEngine};
pub use guard::CloseGuard;
pub use session::{RelaySession, SessionStats};
