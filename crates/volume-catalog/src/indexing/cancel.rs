//! Cooperative cancellation for scans.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Token for cooperative cancellation of a scan.
///
/// Clone is cheap and shares state. The scanner polls it before every item and
/// the streaming processor before every flush; nothing is ever interrupted mid-write.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Wall-clock ceiling for a whole scan.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: std::time::Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn never() -> Self {
        Self(None)
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn deadlines() {
        assert!(!Deadline::never().expired());
        assert!(!Deadline::after(Duration::from_secs(3600)).expired());
        assert!(Deadline::after(Duration::ZERO).expired());
    }
}
