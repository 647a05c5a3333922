//! Shards and the machinery that runs work on them
//!
//! Keys are owned by exactly one shard ([`router::shard_of`]). All access to
//! a shard's data happens on that shard's run-loop, through the
//! [`ShardSet`] dispatch primitives.

pub mod blocking;
pub mod engine_shard;
pub mod executor;
pub mod router;
pub mod tx_queue;

/// Shard identifier, `0..ShardSet::size()`
pub type ShardId = u16;

pub use blocking::{BlockingController, TxId, WatchingTx};
pub use engine_shard::EngineShard;
pub use executor::{join_slots, yield_now, ShardSet};
pub use router::{shard_of, slot_of, SlotId, SlotRange, MAX_SLOT_NUM};
pub use tx_queue::{TxQueue, TxQueueEntry, TxQueueInfo};
