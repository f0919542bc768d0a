//! Close-once guard
//!
//! Shared between the two copy directions of a session (and reused as the
//! stop latch of the listeners). Closing is idempotent: only the first call
//! flips the state, every later call is a no-op, and every waiter is released
//! no matter whether it started waiting before or after the close.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CloseGuard {
    state: Arc<watch::Sender<bool>>,
}

impl CloseGuard {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Close the guard. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the guard is closed
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseGuard {
    fn default() -> Self {
        Self::new()
    }
}
