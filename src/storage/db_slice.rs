//! Shard-local slice of the keyspace
//!
//! A `DbSlice` holds every logical database's tables for one shard: the
//! primary table, the expiry table and the intent-lock table, together with
//! read counters and memory accounting. It is owned by exactly one shard
//! run-loop and is never shared across threads.

use super::lock::{LockMode, LockTable};
use super::table::{BucketPos, PrimeEntry, PrimeTable};
use super::value::PrimeValue;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;

/// Logical database index
pub type DbIndex = u16;

/// Absolute expiry deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirePeriod {
    /// Deadline in milliseconds since the Unix epoch
    pub at_ms: i64,
    /// Set with second granularity (`EX`) rather than milliseconds (`PX`)
    pub sec_precision: bool,
}

/// Tables of one logical database
#[derive(Debug, Default)]
pub struct DbTable {
    pub prime: PrimeTable,
    pub expire: HashMap<Bytes, ExpirePeriod>,
    pub locks: LockTable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    pub key_count: usize,
    pub expire_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceEvents {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceStats {
    pub db_stats: Vec<DbStats>,
    pub events: SliceEvents,
}

pub struct DbSlice {
    tables: Vec<Option<DbTable>>,
    events: SliceEvents,
    used_memory: usize,
}

impl DbSlice {
    pub fn new(max_databases: usize) -> Self {
        let mut tables = Vec::with_capacity(max_databases);
        tables.resize_with(max_databases, || None);
        Self {
            tables,
            events: SliceEvents::default(),
            used_memory: 0,
        }
    }

    pub fn db_array_size(&self) -> usize {
        self.tables.len()
    }

    /// Returns the table for `db` if it has ever been written
    pub fn db_table(&self, db: DbIndex) -> Option<&DbTable> {
        self.tables.get(db as usize).and_then(|t| t.as_ref())
    }

    fn table_mut(&mut self, db: DbIndex) -> Result<&mut DbTable> {
        let slot = self
            .tables
            .get_mut(db as usize)
            .ok_or_else(|| Error::InvalidValue(format!("DB index {} is out of range", db)))?;
        Ok(slot.get_or_insert_with(DbTable::default))
    }

    /// Looks up a key without touching read counters
    pub fn peek(&self, db: DbIndex, key: &[u8]) -> Option<(BucketPos, &PrimeEntry)> {
        self.db_table(db)?.prime.find(key)
    }

    /// Looks up a key on behalf of a client read, counting a hit or a miss
    pub fn find_read(&mut self, db: DbIndex, key: &[u8]) -> Option<&PrimeValue> {
        let found = self
            .tables
            .get(db as usize)
            .and_then(|t| t.as_ref())
            .and_then(|t| t.prime.find(key));
        match found {
            Some((_, entry)) => {
                self.events.hits += 1;
                Some(&entry.value)
            }
            None => {
                self.events.misses += 1;
                None
            }
        }
    }

    /// Stores `value` under `key`, dropping any previous value and expiry
    pub fn set(&mut self, db: DbIndex, key: &[u8], value: PrimeValue) -> Result<()> {
        let added = key.len() + value.malloc_used();
        let table = self.table_mut(db)?;
        table.expire.remove(key);
        let previous = table
            .prime
            .insert(Bytes::copy_from_slice(key), PrimeEntry::new(value));
        let released = previous.map_or(0, |p| key.len() + p.value.malloc_used());
        self.used_memory = self.used_memory + added - released;
        Ok(())
    }

    /// Applies `f` to the value under `key`, creating it with `make` if absent
    ///
    /// Fails with `WrongType` if the existing value is not of the kind `make`
    /// produces. Memory accounting follows the size change.
    pub fn update<M, F, R>(&mut self, db: DbIndex, key: &[u8], make: M, f: F) -> Result<R>
    where
        M: FnOnce() -> PrimeValue,
        F: FnOnce(&mut PrimeValue) -> R,
    {
        let table = self.table_mut(db)?;
        let (before, result, after) = match table.prime.find_mut(key) {
            Some(entry) => {
                let fresh = make();
                if fresh.obj_type() != entry.value.obj_type() {
                    return Err(Error::WrongType);
                }
                let before = entry.value.malloc_used();
                let result = f(&mut entry.value);
                (before, result, entry.value.malloc_used())
            }
            None => {
                let mut value = make();
                let result = f(&mut value);
                let after = key.len() + value.malloc_used();
                table
                    .prime
                    .insert(Bytes::copy_from_slice(key), PrimeEntry::new(value));
                (0, result, after)
            }
        };
        self.used_memory = self.used_memory + after - before;
        Ok(result)
    }

    pub fn del(&mut self, db: DbIndex, key: &[u8]) -> bool {
        let Some(table) = self.tables.get_mut(db as usize).and_then(|t| t.as_mut()) else {
            return false;
        };
        table.expire.remove(key);
        match table.prime.remove(key) {
            Some(entry) => {
                self.used_memory -= key.len() + entry.value.malloc_used();
                true
            }
            None => false,
        }
    }

    /// Attaches an expiry to an existing key
    pub fn set_expire(&mut self, db: DbIndex, key: &[u8], period: ExpirePeriod) -> Result<()> {
        let table = self.table_mut(db)?;
        let entry = table.prime.find_mut(key).ok_or(Error::KeyNotFound)?;
        entry.has_expire = true;
        table.expire.insert(Bytes::copy_from_slice(key), period);
        Ok(())
    }

    pub fn expire_time(&self, db: DbIndex, key: &[u8]) -> Option<ExpirePeriod> {
        self.db_table(db)?.expire.get(key).copied()
    }

    /// Marks a value as offloaded to secondary storage
    pub fn set_external(&mut self, db: DbIndex, key: &[u8], len: u32) -> Result<()> {
        let table = self.table_mut(db)?;
        let entry = table.prime.find_mut(key).ok_or(Error::KeyNotFound)?;
        entry.external_len = Some(len);
        Ok(())
    }

    /// Whether a lock in `mode` could be granted on every key right now
    pub fn check_lock(&self, mode: LockMode, db: DbIndex, keys: &[&[u8]]) -> bool {
        match self.db_table(db) {
            Some(table) => keys.iter().all(|k| table.locks.check(mode, k)),
            None => true,
        }
    }

    pub fn acquire_lock(&mut self, mode: LockMode, db: DbIndex, key: &[u8]) -> Result<bool> {
        Ok(self.table_mut(db)?.locks.acquire(mode, key))
    }

    pub fn release_lock(&mut self, mode: LockMode, db: DbIndex, key: &[u8]) {
        if let Some(table) = self.tables.get_mut(db as usize).and_then(|t| t.as_mut()) {
            table.locks.release(mode, key);
        }
    }

    /// Drops every key in every database; lock state is kept
    pub fn flush_all(&mut self) {
        for table in self.tables.iter_mut().flatten() {
            table.prime.clear();
            table.expire.clear();
        }
        self.used_memory = 0;
    }

    pub fn used_memory(&self) -> usize {
        self.used_memory
    }

    pub fn stats(&self) -> SliceStats {
        let db_stats = self
            .tables
            .iter()
            .map(|t| match t {
                Some(table) => DbStats {
                    key_count: table.prime.len(),
                    expire_count: table.expire.len(),
                },
                None => DbStats::default(),
            })
            .collect();
        SliceStats {
            db_stats,
            events: self.events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::ObjType;
    use std::collections::VecDeque;

    fn s(v: &str) -> PrimeValue {
        PrimeValue::Str(Bytes::copy_from_slice(v.as_bytes()))
    }

    #[test]
    fn test_set_and_memory_accounting() -> Result<()> {
        let mut slice = DbSlice::new(16);
        slice.set(0, b"key", s("value"))?;
        assert_eq!(slice.used_memory(), 8);

        slice.set(0, b"key", s("v"))?;
        assert_eq!(slice.used_memory(), 4);

        assert!(slice.del(0, b"key"));
        assert_eq!(slice.used_memory(), 0);
        assert!(!slice.del(0, b"key"));
        Ok(())
    }

    #[test]
    fn test_read_counters() -> Result<()> {
        let mut slice = DbSlice::new(16);
        slice.set(1, b"a", s("1"))?;
        assert!(slice.find_read(1, b"a").is_some());
        assert!(slice.find_read(1, b"b").is_none());
        assert!(slice.find_read(0, b"a").is_none());
        // peek never counts
        assert!(slice.peek(1, b"a").is_some());

        let stats = slice.stats();
        assert_eq!(stats.events, SliceEvents { hits: 1, misses: 2 });
        assert_eq!(stats.db_stats[1].key_count, 1);
        Ok(())
    }

    #[test]
    fn test_update_rejects_wrong_type() -> Result<()> {
        let mut slice = DbSlice::new(16);
        slice.set(0, b"k", s("v"))?;
        let res = slice.update(0, b"k", || PrimeValue::List(VecDeque::new()), |_| ());
        assert!(matches!(res, Err(Error::WrongType)));

        let len = slice.update(
            0,
            b"l",
            || PrimeValue::List(VecDeque::new()),
            |v| {
                if let PrimeValue::List(items) = v {
                    items.push_front(Bytes::from_static(b"x"));
                }
                v.size()
            },
        )?;
        assert_eq!(len, 1);
        assert_eq!(slice.peek(0, b"l").map(|(_, e)| e.value.obj_type()), Some(ObjType::List));
        Ok(())
    }

    #[test]
    fn test_expire_bookkeeping() -> Result<()> {
        let mut slice = DbSlice::new(16);
        assert!(matches!(
            slice.set_expire(0, b"missing", ExpirePeriod { at_ms: 1, sec_precision: false }),
            Err(Error::KeyNotFound)
        ));

        slice.set(0, b"k", s("v"))?;
        slice.set_expire(0, b"k", ExpirePeriod { at_ms: 10, sec_precision: true })?;
        assert_eq!(slice.stats().db_stats[0].expire_count, 1);

        // Overwrite clears the expiry
        slice.set(0, b"k", s("w"))?;
        assert!(slice.expire_time(0, b"k").is_none());
        Ok(())
    }

    #[test]
    fn test_out_of_range_db() {
        let mut slice = DbSlice::new(2);
        assert!(slice.set(5, b"k", s("v")).is_err());
        assert!(slice.peek(5, b"k").is_none());
    }
}
