//! Key routing: key → owning shard, key → cluster slot
//!
//! Shard selection hashes the whole key. Slot selection follows the Redis
//! Cluster scheme (CRC16/XMODEM over the hash tag if present, modulo 16384),
//! so slot ranges can be used to filter generated keys for migration windows.

use super::ShardId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Cluster slot identifier
pub type SlotId = u16;

/// Highest valid slot id (inclusive)
pub const MAX_SLOT_NUM: SlotId = 0x3FFF;

/// Inclusive range of slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: SlotId,
    pub end: SlotId,
}

impl SlotRange {
    pub fn contains(&self, slot: SlotId) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// Calculate the owning shard for a key
///
/// Stable for a fixed `shard_count`; changing the shard count requires a
/// rehash of the dataset, which is the caller's concern.
pub fn shard_of(key: &[u8], shard_count: usize) -> ShardId {
    debug_assert!(shard_count > 0);
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shard_count as u64) as ShardId
}

/// Calculate the cluster slot for a key
pub fn slot_of(key: &[u8]) -> SlotId {
    crc16(hash_tag(key)) & MAX_SLOT_NUM
}

/// Returns the `{tag}` portion of a key if it has a non-empty one
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

/// CRC16/XMODEM (polynomial 0x1021, zero init)
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_slot_matches_redis_cluster() {
        assert_eq!(slot_of(b"foo"), 12182);
        assert_eq!(slot_of(b"123456789"), 0x31C3 & MAX_SLOT_NUM);
    }

    #[test]
    fn test_hash_tags_share_slot() {
        assert_eq!(slot_of(b"{user1000}.following"), slot_of(b"{user1000}.followers"));
        assert_eq!(slot_of(b"{user1000}.following"), slot_of(b"user1000"));
        // Empty tag hashes the whole key
        assert_eq!(slot_of(b"foo{}bar"), crc16(b"foo{}bar") & MAX_SLOT_NUM);
    }

    #[test]
    fn test_shard_routing_is_deterministic() {
        for i in 0..1000 {
            let key = format!("key:{}", i);
            let sid = shard_of(key.as_bytes(), 4);
            assert!(sid < 4);
            assert_eq!(sid, shard_of(key.as_bytes(), 4));
        }
        assert_eq!(shard_of(b"anything", 1), 0);
    }

    #[test]
    fn test_slot_range_is_inclusive() {
        let range = SlotRange { start: 0, end: 100 };
        assert!(range.contains(0));
        assert!(range.contains(100));
        assert!(!range.contains(101));
    }
}
