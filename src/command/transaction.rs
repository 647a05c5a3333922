//! Shard-local, non-atomic execution context
//!
//! Used to apply a batch of internally generated commands on one shard as if
//! a client had sent them, without cross-shard coordination. Commands run in
//! the order they are invoked. Every key touched is held under an exclusive
//! intent lock until the transaction is dropped, whatever the outcome of the
//! individual commands.

use super::registry::{CommandId, OpArgs};
use super::reply::Reply;
use crate::error::Result;
use crate::shard::EngineShard;
use crate::storage::{DbIndex, LockMode};
use bytes::Bytes;
use std::collections::HashSet;
use tracing::trace;

pub struct StubTransaction<'a> {
    shard: &'a EngineShard,
    db: DbIndex,
    locked: HashSet<Bytes>,
    executed: usize,
}

impl<'a> StubTransaction<'a> {
    pub fn new(shard: &'a EngineShard, db: DbIndex) -> Self {
        Self {
            shard,
            db,
            locked: HashSet::new(),
            executed: 0,
        }
    }

    /// Runs `cid` with `args` (key first) and returns its reply
    pub fn invoke(&mut self, cid: &CommandId, args: &[Bytes]) -> Result<Reply> {
        if let Some(key) = args.first() {
            if !self.locked.contains(key) {
                self.shard
                    .db_slice_mut()
                    .acquire_lock(LockMode::Exclusive, self.db, key)?;
                self.locked.insert(key.clone());
            }
        }

        let op = OpArgs {
            shard: self.shard,
            db: self.db,
        };
        self.executed += 1;
        cid.invoke(&op, args)
    }

    /// Number of commands run so far
    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn locked_keys(&self) -> usize {
        self.locked.len()
    }
}

impl Drop for StubTransaction<'_> {
    fn drop(&mut self) {
        let mut slice = self.shard.db_slice_mut();
        for key in self.locked.drain() {
            slice.release_lock(LockMode::Exclusive, self.db, &key);
        }
        trace!(
            shard = self.shard.shard_id(),
            executed = self.executed,
            "Stub transaction finished"
        );
    }
}
