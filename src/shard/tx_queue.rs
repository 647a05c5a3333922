//! Shard transaction queue and its contention analysis

use super::blocking::TxId;
use crate::storage::{DbIndex, DbSlice, LockMode};
use bytes::Bytes;
use std::collections::VecDeque;

/// A transaction scheduled on this shard
#[derive(Debug, Clone)]
pub struct TxQueueEntry {
    pub id: TxId,
    pub db: DbIndex,
    /// Global transactions lock the whole shard rather than keys
    pub global: bool,
    /// Armed transactions are ready to run once their locks allow it
    pub armed: bool,
    pub keys: Vec<(Bytes, LockMode)>,
}

/// Snapshot of queue depth and lock contention for one shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxQueueInfo {
    pub tx_armed: usize,
    pub tx_total: usize,
    pub tx_global: usize,
    pub tx_runnable: usize,
    pub total_locks: usize,
    pub contended_locks: usize,
    pub max_contention_score: u32,
    pub max_contention_lock_name: String,
}

#[derive(Debug, Default)]
pub struct TxQueue {
    entries: VecDeque<TxQueueEntry>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TxQueueEntry) {
        self.entries.push_back(entry);
    }

    pub fn remove(&mut self, id: TxId) -> Option<TxQueueEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counts armed, global and runnable transactions and summarizes lock
    /// contention across every database of `slice`
    pub fn analyze(&self, slice: &DbSlice) -> TxQueueInfo {
        let mut info = TxQueueInfo {
            tx_total: self.entries.len(),
            ..Default::default()
        };

        for entry in &self.entries {
            if !entry.armed {
                continue;
            }
            info.tx_armed += 1;
            if entry.global {
                info.tx_global += 1;
                continue;
            }
            let contended = slice.db_table(entry.db).is_some_and(|table| {
                table
                    .locks
                    .iter()
                    .any(|(key, lock)| lock.is_contended() && entry.keys.iter().any(|(k, _)| k == key))
            });
            if !contended {
                info.tx_runnable += 1;
            }
        }

        for db in 0..slice.db_array_size() {
            let Some(table) = slice.db_table(db as DbIndex) else {
                continue;
            };
            info.total_locks += table.locks.len();
            for (key, lock) in table.locks.iter() {
                if !lock.is_contended() {
                    continue;
                }
                info.contended_locks += 1;
                let score = lock.contention_score();
                let name = String::from_utf8_lossy(key);
                // ties go to the smallest key
                let wins = score > info.max_contention_score
                    || (score == info.max_contention_score
                        && score > 0
                        && *name < *info.max_contention_lock_name);
                if wins {
                    info.max_contention_score = score;
                    info.max_contention_lock_name = name.into_owned();
                }
            }
        }

        info
    }
}
