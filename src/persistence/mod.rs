//! Dataset snapshots
//!
//! The [`Persistence`] trait is what the debug `RELOAD`/`LOAD` flows need:
//! write every shard out, read a file back in. [`SnapshotPersistence`] keeps
//! the dataset as a single JSON document:
//!
//! ```text
//! { "version": 1, "created_at": "...", "entries": [
//!     { "db": 0, "key": [..], "value": { "Str": [..] }, "expire_at_ms": null, ... },
//!     ...
//! ] }
//! ```
//!
//! Keys and string payloads are stored as byte arrays so binary data survives
//! the round trip.

mod snapshot;

pub use snapshot::{SnapshotEntry, SnapshotFile, SnapshotPersistence, SnapshotValue, SNAPSHOT_VERSION};

use crate::error::Result;
use crate::shard::ShardSet;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Save/load of the full dataset
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Writes every shard to the default location and returns the file written
    async fn save(&self, shard_set: &ShardSet) -> Result<PathBuf>;

    /// Loads `path` into the shards and returns the number of keys restored
    ///
    /// Existing keys are overwritten, not cleared; callers flush first.
    async fn load(&self, shard_set: &ShardSet, path: &Path) -> Result<usize>;

    /// File written by the last successful save
    fn last_save_file(&self) -> Option<PathBuf>;

    /// Location used when no file name is given
    fn default_path(&self) -> PathBuf;
}
