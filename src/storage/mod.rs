//! Storage layer
//!
//! # Architecture
//!
//! Every shard owns one [`DbSlice`]:
//!
//! ```text
//! DbSlice (one per shard)
//!   └─→ DbTable[db_index]
//!        ├─→ PrimeTable   key → PrimeEntry (bucketed, cursor traversal)
//!        ├─→ expire       key → ExpirePeriod
//!        └─→ LockTable    key → IntentLock
//! ```
//!
//! Nothing here is thread-safe on purpose: a slice is only ever touched from
//! its shard's run-loop.

pub mod compression;
pub mod db_slice;
pub mod lock;
pub mod table;
pub mod value;

pub use compression::CompressionEstimate;
pub use db_slice::{DbIndex, DbSlice, DbStats, DbTable, ExpirePeriod, SliceEvents, SliceStats};
pub use lock::{IntentLock, LockMode, LockTable};
pub use table::{BucketPos, Cursor, PrimeEntry, PrimeTable};
pub use value::{parse_int, ContainerEntry, Encoding, ObjType, PrimeValue};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
