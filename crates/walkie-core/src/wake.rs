//! Best-effort screen wake lock
//!
//! Mobile platforms put the screen (and with it the network) to sleep in the
//! middle of a conversation. While a call is active the controller asks for a
//! wake lock; platforms without the capability simply refuse, which is logged
//! and otherwise ignored.

use std::sync::Arc;

use tracing::debug;

/// Platform screen wake lock
pub trait WakeLock: Send + Sync {
    fn request(&self) -> Result<(), String>;
    fn release(&self);
}

/// Tracks whether the lock is held so requests and releases stay balanced
pub struct KeepAwake {
    lock: Option<Arc<dyn WakeLock>>,
    held: bool,
}

impl KeepAwake {
    pub fn new(lock: Option<Arc<dyn WakeLock>>) -> Self {
        Self { lock, held: false }
    }

    /// Disabled instance that never touches the platform
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn acquire(&mut self) {
        if self.held {
            return;
        }
        if let Some(lock) = &self.lock {
            match lock.request() {
                Ok(()) => self.held = true,
                Err(e) => debug!(error = %e, "Wake lock unavailable"),
            }
        }
    }

    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        if let Some(lock) = &self.lock {
            lock.release();
        }
        self.held = false;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackWakeLock;

    #[test]
    fn test_acquire_release_balanced() {
        let platform = LoopbackWakeLock::new(true);
        let mut keep = KeepAwake::new(Some(Arc::new(platform.clone())));

        keep.acquire();
        keep.acquire();
        assert!(keep.is_held());
        assert_eq!(platform.requests(), 1);

        keep.release();
        keep.release();
        assert!(!keep.is_held());
        assert!(!platform.is_held());
    }

    #[test]
    fn test_refusal_is_ignored() {
        let platform = LoopbackWakeLock::new(false);
        let mut keep = KeepAwake::new(Some(Arc::new(platform.clone())));

        keep.acquire();
        assert!(!keep.is_held());
        keep.release();
        assert_eq!(platform.requests(), 1);
    }

    #[test]
    fn test_disabled_is_noop() {
        let mut keep = KeepAwake::disabled();
        keep.acquire();
        assert!(!keep.is_held());
    }
}
