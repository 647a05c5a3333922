//! Bucketed primary table with resumable cursor traversal
//!
//! Keys hash into a power-of-two array of buckets. Traversal visits one
//! bucket per step and hands back a cursor, so a long scan can stop between
//! steps, yield, and resume. The cursor advances in reverse-binary order,
//! which keeps it valid when the table doubles between steps: every key
//! present for the whole scan is visited at least once.

use super::value::PrimeValue;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const INITIAL_BUCKETS: usize = 64;
/// Average entries per bucket before the table doubles
const MAX_LOAD: usize = 8;
/// Mixed into the bucket hash so bucket choice is independent of shard choice
const BUCKET_SEED: u8 = 0xA5;

/// Position of an entry inside the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPos {
    pub bucket_id: u32,
    pub slot_id: u32,
}

/// Scan cursor; zero both starts and terminates a traversal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor(u64);

impl Cursor {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_done(&self) -> bool {
        self.0 == 0
    }
}

/// Value plus per-key metadata
#[derive(Debug, Clone, PartialEq)]
pub struct PrimeEntry {
    pub value: PrimeValue,
    pub has_expire: bool,
    /// Length of the offloaded copy when the value lives in secondary storage
    pub external_len: Option<u32>,
}

impl PrimeEntry {
    pub fn new(value: PrimeValue) -> Self {
        Self {
            value,
            has_expire: false,
            external_len: None,
        }
    }
}

#[derive(Debug)]
pub struct PrimeTable {
    buckets: Vec<Vec<(Bytes, PrimeEntry)>>,
    len: usize,
}

impl Default for PrimeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimeTable {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); INITIAL_BUCKETS],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        BUCKET_SEED.hash(&mut hasher);
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.buckets.len() - 1)
    }

    pub fn find(&self, key: &[u8]) -> Option<(BucketPos, &PrimeEntry)> {
        let bucket_id = self.bucket_of(key);
        self.buckets[bucket_id]
            .iter()
            .position(|(k, _)| k.as_ref() == key)
            .map(|slot_id| {
                let pos = BucketPos {
                    bucket_id: bucket_id as u32,
                    slot_id: slot_id as u32,
                };
                (pos, &self.buckets[bucket_id][slot_id].1)
            })
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut PrimeEntry> {
        let bucket_id = self.bucket_of(key);
        self.buckets[bucket_id]
            .iter_mut()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, entry)| entry)
    }

    /// Inserts or replaces; returns the previous entry
    pub fn insert(&mut self, key: Bytes, entry: PrimeEntry) -> Option<PrimeEntry> {
        if let Some(existing) = self.find_mut(&key) {
            return Some(std::mem::replace(existing, entry));
        }
        if self.len + 1 > self.buckets.len() * MAX_LOAD {
            self.grow();
        }
        let bucket_id = self.bucket_of(&key);
        self.buckets[bucket_id].push((key, entry));
        self.len += 1;
        None
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<PrimeEntry> {
        let bucket_id = self.bucket_of(key);
        let bucket = &mut self.buckets[bucket_id];
        let slot = bucket.iter().position(|(k, _)| k.as_ref() == key)?;
        self.len -= 1;
        Some(bucket.swap_remove(slot).1)
    }

    pub fn clear(&mut self) {
        self.buckets = vec![Vec::new(); INITIAL_BUCKETS];
        self.len = 0;
    }

    fn grow(&mut self) {
        let doubled = self.buckets.len() * 2;
        let old = std::mem::replace(&mut self.buckets, vec![Vec::new(); doubled]);
        for (key, entry) in old.into_iter().flatten() {
            let bucket_id = self.bucket_of(&key);
            self.buckets[bucket_id].push((key, entry));
        }
    }

    /// Visits every entry of the bucket under `cursor` and returns the next cursor
    pub fn traverse<F>(&self, cursor: Cursor, mut cb: F) -> Cursor
    where
        F: FnMut(&Bytes, &PrimeEntry),
    {
        let mask = (self.buckets.len() - 1) as u64;
        for (key, entry) in &self.buckets[(cursor.0 & mask) as usize] {
            cb(key, entry);
        }

        let v = cursor.0 | !mask;
        Cursor(v.reverse_bits().wrapping_add(1).reverse_bits())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &PrimeEntry)> {
        self.buckets.iter().flatten().map(|(k, e)| (k, e))
    }
}
