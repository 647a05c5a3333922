//! Log throttling helpers

use std::sync::atomic::{AtomicU64, Ordering};

/// Counted-sample gate: fires on the first call and then on every N-th
///
/// Safe to share between shard threads; the counter is a relaxed atomic so
/// the sampling is approximate under contention.
#[derive(Debug)]
pub(crate) struct LogEveryN {
    n: u64,
    count: AtomicU64,
}

impl LogEveryN {
    pub(crate) const fn new(n: u64) -> Self {
        Self {
            n,
            count: AtomicU64::new(0),
        }
    }

    /// Counts one occurrence; returns the running total when this one should be logged
    pub(crate) fn tick(&self) -> Option<u64> {
        let seen = self.count.fetch_add(1, Ordering::Relaxed);
        if self.n <= 1 || seen % self.n == 0 {
            Some(seen + 1)
        } else {
            None
        }
    }
}
