//! Source of the pending data-subject request count.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Supplies the number of open GDPR requests, owned by an external layer.
pub trait PendingRequestSource: Send + Sync + Debug {
    fn pending(&self) -> u64;
}

/// In-process counter for embedders that track requests themselves.
#[derive(Debug, Default)]
pub struct PendingRequestCounter {
    pending: AtomicU64,
}

impl PendingRequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one request resolved. Never goes below zero.
    pub fn resolved(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn set(&self, pending: u64) {
        self.pending.store(pending, Ordering::Relaxed);
    }
}

impl PendingRequestSource for PendingRequestCounter {
    fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_saturates_at_zero() {
        let counter = PendingRequestCounter::new();
        counter.opened();
        counter.opened();
        counter.resolved();
        assert_eq!(counter.pending(), 1);

        counter.resolved();
        counter.resolved();
        assert_eq!(counter.pending(), 0);

        counter.set(5);
        assert_eq!(counter.pending(), 5);
    }
}
