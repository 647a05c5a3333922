//! State owned by one shard run-loop

use super::blocking::{BlockingController, TxId};
use super::tx_queue::{TxQueue, TxQueueEntry, TxQueueInfo};
use super::ShardId;
use crate::storage::DbSlice;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;

/// Everything a shard mutates, reachable only from the shard's own thread
///
/// Interior mutability is single-threaded (`RefCell`): a task may borrow
/// between yield points but must not hold a borrow across one.
pub struct EngineShard {
    shard_id: ShardId,
    db_slice: RefCell<DbSlice>,
    blocking: RefCell<BlockingController>,
    tx_queue: RefCell<TxQueue>,
    /// Executed transaction descriptors → count
    exec_freq: RefCell<HashMap<String, u64>>,
}

impl EngineShard {
    pub fn new(shard_id: ShardId, max_databases: usize) -> Self {
        Self {
            shard_id,
            db_slice: RefCell::new(DbSlice::new(max_databases)),
            blocking: RefCell::new(BlockingController::new()),
            tx_queue: RefCell::new(TxQueue::new()),
            exec_freq: RefCell::new(HashMap::new()),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn db_slice(&self) -> Ref<'_, DbSlice> {
        self.db_slice.borrow()
    }

    pub fn db_slice_mut(&self) -> RefMut<'_, DbSlice> {
        self.db_slice.borrow_mut()
    }

    pub fn blocking_controller(&self) -> Ref<'_, BlockingController> {
        self.blocking.borrow()
    }

    pub fn blocking_controller_mut(&self) -> RefMut<'_, BlockingController> {
        self.blocking.borrow_mut()
    }

    pub fn used_memory(&self) -> usize {
        self.db_slice.borrow().used_memory()
    }

    /// Counts one execution of a MULTI/EXEC descriptor
    pub fn record_exec(&self, descriptor: &str) {
        *self
            .exec_freq
            .borrow_mut()
            .entry(descriptor.to_string())
            .or_insert(0) += 1;
    }

    pub fn exec_freq_count(&self) -> HashMap<String, u64> {
        self.exec_freq.borrow().clone()
    }

    /// Queues a transaction and records its intent locks
    pub fn enqueue_tx(&self, entry: TxQueueEntry) -> crate::error::Result<()> {
        let mut slice = self.db_slice.borrow_mut();
        for (key, mode) in &entry.keys {
            slice.acquire_lock(*mode, entry.db, key)?;
        }
        self.tx_queue.borrow_mut().push(entry);
        Ok(())
    }

    /// Removes a transaction from the queue and releases its intent locks
    pub fn finish_tx(&self, id: TxId) -> bool {
        let Some(entry) = self.tx_queue.borrow_mut().remove(id) else {
            return false;
        };
        let mut slice = self.db_slice.borrow_mut();
        for (key, mode) in &entry.keys {
            slice.release_lock(*mode, entry.db, key);
        }
        true
    }

    pub fn analyze_tx_queue(&self) -> TxQueueInfo {
        self.tx_queue.borrow().analyze(&self.db_slice.borrow())
    }
}
