//! Read-only inspection of a single key

use crate::error::{Error, Result};
use crate::shard::{EngineShard, ShardId};
use crate::storage::{compression, now_ms, CompressionEstimate, DbIndex, Encoding, LockMode, PrimeValue};

/// Intent lock currently held on a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStatus {
    #[default]
    None,
    Shared,
    Exclusive,
}

/// Point-in-time snapshot of one key's layout and state
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectInfo {
    pub found: bool,
    pub encoding: Option<Encoding>,
    pub bucket_id: u32,
    pub slot_id: u32,
    pub lock_status: LockStatus,
    /// `expire_at - now` in milliseconds; may be negative
    pub ttl: Option<i64>,
    pub has_sec_precision: bool,
    pub external_len: Option<u32>,
}

/// Lock held on `key`, without acquiring anything
///
/// If an exclusive lock could not be granted, a grantable shared lock means
/// the key is held shared; otherwise it is held exclusively.
pub fn lock_status(shard: &EngineShard, db: DbIndex, key: &[u8]) -> LockStatus {
    let slice = shard.db_slice();
    if slice.check_lock(LockMode::Exclusive, db, &[key]) {
        LockStatus::None
    } else if slice.check_lock(LockMode::Shared, db, &[key]) {
        LockStatus::Shared
    } else {
        LockStatus::Exclusive
    }
}

/// Structural metadata for `key`; never touches read counters
pub fn inspect_op(shard: &EngineShard, db: DbIndex, key: &[u8]) -> ObjectInfo {
    let mut info = ObjectInfo::default();
    {
        let slice = shard.db_slice();
        if let Some((pos, entry)) = slice.peek(db, key) {
            info.found = true;
            info.encoding = Some(entry.value.encoding());
            info.bucket_id = pos.bucket_id;
            info.slot_id = pos.slot_id;
            info.external_len = entry.external_len;

            if entry.has_expire {
                if let Some(period) = slice.expire_time(db, key) {
                    info.ttl = Some(period.at_ms - now_ms());
                    info.has_sec_precision = period.sec_precision;
                }
            }
        }
    }
    info.lock_status = lock_status(shard, db, key);
    info
}

/// Compression trial for a string value
pub fn estimate_compression(shard: &EngineShard, db: DbIndex, key: &[u8]) -> Result<CompressionEstimate> {
    let slice = shard.db_slice();
    let (_, entry) = slice.peek(db, key).ok_or(Error::KeyNotFound)?;
    match &entry.value {
        PrimeValue::Str(s) => compression::estimate(s),
        _ => Err(Error::WrongType),
    }
}

/// `encoding:<enc> bucket_id:<b> slot:<s> shard:<sid>[ ttl:..][ spill_len:..][ lock:..]`
pub fn format_object_info(info: &ObjectInfo, shard: ShardId) -> String {
    let encoding = info.encoding.map_or("unknown", |e| e.name());
    let mut out = format!(
        "encoding:{} bucket_id:{} slot:{} shard:{}",
        encoding, info.bucket_id, info.slot_id, shard
    );
    if let Some(ttl) = info.ttl {
        let unit = if info.has_sec_precision { "s" } else { "ms" };
        out.push_str(&format!(" ttl:{}{}", ttl, unit));
    }
    if let Some(len) = info.external_len {
        out.push_str(&format!(" spill_len:{}", len));
    }
    match info.lock_status {
        LockStatus::None => {}
        LockStatus::Shared => out.push_str(" lock:s"),
        LockStatus::Exclusive => out.push_str(" lock:x"),
    }
    out
}

/// `raw_size: R, compressed_size: C[ ratio: C/R]`
pub fn format_compression(est: &CompressionEstimate) -> String {
    let mut out = format!(
        "raw_size: {}, compressed_size: {}",
        est.raw_size, est.compressed_size
    );
    if let Some(ratio) = est.ratio() {
        out.push_str(&format!(" ratio: {}", ratio));
    }
    out
}
