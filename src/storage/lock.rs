//! Intent locks
//!
//! An intent lock counts shared and exclusive requests for a key. Requests are
//! always recorded; whether a request could run right now is answered by
//! [`IntentLock::check`]. Counts above one therefore mean contention, which
//! is what the transaction-queue analysis reports.

use bytes::Bytes;
use std::collections::HashMap;

/// Lock intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Shared/exclusive request counters for one key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentLock {
    shared: u32,
    exclusive: u32,
}

impl IntentLock {
    /// Whether a request in `mode` could be granted right now
    pub fn check(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive == 0,
            LockMode::Exclusive => self.exclusive == 0 && self.shared == 0,
        }
    }

    /// Records a request and returns whether it was granted immediately
    pub fn acquire(&mut self, mode: LockMode) -> bool {
        let granted = self.check(mode);
        match mode {
            LockMode::Shared => self.shared += 1,
            LockMode::Exclusive => self.exclusive += 1,
        }
        granted
    }

    pub fn release(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared = self.shared.saturating_sub(1),
            LockMode::Exclusive => self.exclusive = self.exclusive.saturating_sub(1),
        }
    }

    pub fn is_free(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }

    pub fn shared_count(&self) -> u32 {
        self.shared
    }

    pub fn exclusive_count(&self) -> u32 {
        self.exclusive
    }

    /// More requests are queued than could run together
    pub fn is_contended(&self) -> bool {
        self.exclusive > 1 || (self.exclusive == 1 && self.shared > 0)
    }

    /// Exclusive requests dominate the score; shared requests break ties
    pub fn contention_score(&self) -> u32 {
        self.exclusive * 256 + self.shared
    }
}

/// Per-database table of intent locks keyed by key name
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<Bytes, IntentLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// An absent entry is a free lock
    pub fn check(&self, mode: LockMode, key: &[u8]) -> bool {
        self.locks.get(key).map_or(true, |lock| lock.check(mode))
    }

    pub fn acquire(&mut self, mode: LockMode, key: &[u8]) -> bool {
        self.locks
            .entry(Bytes::copy_from_slice(key))
            .or_default()
            .acquire(mode)
    }

    /// Releases one request; free locks are dropped from the table
    pub fn release(&mut self, mode: LockMode, key: &[u8]) {
        if let Some(lock) = self.locks.get_mut(key) {
            lock.release(mode);
            if lock.is_free() {
                self.locks.remove(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &IntentLock)> {
        self.locks.iter()
    }
}
