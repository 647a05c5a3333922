//! Bulk synthetic population
//!
//! `[0, N)` is split into one contiguous range per worker. Each worker walks
//! its range, routes every kept key to its shard and accumulates per-shard
//! batches:
//!
//! ```text
//! worker 0: [0, N/W)      ──┬─▶ batch(shard 0) ── full ──▶ ShardSet::add
//! worker 1: [N/W, 2N/W)   ──┤   batch(shard 1)
//! ...                       └─▶ ...              ── end ───▶ flush, wait
//! ```
//!
//! With a slot filter, keys outside the range are skipped without counting.
//! A worker that runs off the end of its range continues at `from + N`, so
//! workers only ever visit indices congruent to their own range modulo `N`
//! and their keysets stay disjoint.

use crate::command::{CommandRegistry, StubTransaction};
use crate::error::{Error, Result};
use crate::logging::LogEveryN;
use crate::metrics::{POPULATE_BATCHES_TOTAL, POPULATE_KEYS_TOTAL, RESOLUTION_FAILURES_TOTAL};
use crate::shard::{join_slots, shard_of, slot_of, yield_now, EngineShard, ShardId, ShardSet, SlotRange, MAX_SLOT_NUM};
use crate::storage::DbIndex;
use bytes::Bytes;
use rand::Rng;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maximum keys per dispatched batch
pub const BATCH_CAPACITY: usize = 32;

/// A worker yields after this many dispatched batches
pub const YIELD_EVERY_BATCHES: u64 = 50;

pub const DEFAULT_PREFIX: &str = "key";
pub const DEFAULT_VALUE_SIZE: usize = 16;

static RESOLUTION_FAILURE_LOG: LogEveryN = LogEveryN::new(10_000);

/// Kind of value generated for each key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PopulateType {
    #[default]
    String,
    List,
    Set,
    Hash,
    ZSet,
    Json,
}

impl PopulateType {
    /// Command used to write one key of this kind
    pub fn command_name(&self) -> &'static str {
        match self {
            PopulateType::String => "SET",
            PopulateType::List => "LPUSH",
            PopulateType::Set => "SADD",
            PopulateType::Hash => "HSET",
            PopulateType::ZSet => "ZADD",
            PopulateType::Json => "JSON.SET",
        }
    }
}

impl FromStr for PopulateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STRING" => Ok(PopulateType::String),
            "LIST" => Ok(PopulateType::List),
            "SET" => Ok(PopulateType::Set),
            "HASH" => Ok(PopulateType::Hash),
            "ZSET" => Ok(PopulateType::ZSet),
            "JSON" => Ok(PopulateType::Json),
            _ => Err(Error::Syntax),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PopulateOptions {
    pub total_count: u64,
    pub prefix: String,
    pub val_size: usize,
    pub random_values: bool,
    pub kind: PopulateType,
    pub elements: u32,
    pub slot_range: Option<SlotRange>,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            total_count: 0,
            prefix: DEFAULT_PREFIX.to_string(),
            val_size: DEFAULT_VALUE_SIZE,
            random_values: false,
            kind: PopulateType::default(),
            elements: 1,
            slot_range: None,
        }
    }
}

fn utf8(arg: &Bytes) -> Result<&str> {
    std::str::from_utf8(arg).map_err(|_| Error::Syntax)
}

fn parse_slot(arg: &Bytes) -> Result<u16> {
    let slot: u32 = utf8(arg)?.parse().map_err(|_| Error::InvalidInt)?;
    if slot > MAX_SLOT_NUM as u32 {
        return Err(Error::InvalidValue(format!(
            "slot {} exceeds the maximum slot {}",
            slot, MAX_SLOT_NUM
        )));
    }
    Ok(slot as u16)
}

impl PopulateOptions {
    /// Parses `<count> [prefix] [size] [RAND] [SLOTS start end] [TYPE type] [ELEMENTS n]`
    pub fn parse(args: &[Bytes]) -> Result<Self> {
        let Some(count) = args.first() else {
            return Err(Error::UnknownSubcommand("populate".to_string(), "DEBUG"));
        };

        let mut options = PopulateOptions {
            total_count: utf8(count)?.parse().map_err(|_| Error::InvalidInt)?,
            ..Default::default()
        };
        if let Some(prefix) = args.get(1) {
            options.prefix = String::from_utf8_lossy(prefix).into_owned();
        }
        if let Some(size) = args.get(2) {
            options.val_size = utf8(size)?.parse().map_err(|_| Error::InvalidInt)?;
        }

        let mut i = 3;
        while i < args.len() {
            match utf8(&args[i])?.to_ascii_uppercase().as_str() {
                "RAND" => options.random_values = true,
                "TYPE" => {
                    let kind = args.get(i + 1).ok_or(Error::Syntax)?;
                    options.kind = utf8(kind)?.parse()?;
                    i += 1;
                }
                "ELEMENTS" => {
                    let n = args.get(i + 1).ok_or(Error::Syntax)?;
                    options.elements = utf8(n)?.parse().map_err(|_| Error::Syntax)?;
                    i += 1;
                }
                "SLOTS" => {
                    if i + 2 >= args.len() {
                        return Err(Error::Syntax);
                    }
                    let start = parse_slot(&args[i + 1])?;
                    let end = parse_slot(&args[i + 2])?;
                    if start > end {
                        return Err(Error::InvalidValue(format!(
                            "slot range start {} is above its end {}",
                            start, end
                        )));
                    }
                    options.slot_range = Some(SlotRange { start, end });
                    i += 2;
                }
                _ => return Err(Error::Syntax),
            }
            i += 1;
        }

        Ok(options)
    }
}

/// Splits `[0, total)` into `workers` contiguous `(from, count)` ranges
///
/// All ranges but the last have `total / workers` items; the last one takes
/// the remainder.
pub fn split_ranges(total: u64, workers: usize) -> Vec<(u64, u64)> {
    let workers = workers.max(1) as u64;
    let chunk = total / workers;
    let mut ranges = Vec::with_capacity(workers as usize);
    let mut from = 0;
    for _ in 0..workers - 1 {
        ranges.push((from, chunk));
        from += chunk;
    }
    ranges.push((from, total - from));
    ranges
}

/// Kept `(index, key)` pairs of one worker's range
pub struct RangeWalker {
    prefix: String,
    slot_range: Option<SlotRange>,
    total: u64,
    count: u64,
    to: u64,
    index: u64,
    added: u64,
}

impl RangeWalker {
    pub fn new(options: &PopulateOptions, from: u64, count: u64) -> Self {
        Self {
            prefix: options.prefix.clone(),
            slot_range: options.slot_range,
            total: options.total_count,
            count,
            to: from + count,
            index: from,
            added: 0,
        }
    }
}

impl Iterator for RangeWalker {
    type Item = (u64, String);

    fn next(&mut self) -> Option<Self::Item> {
        while self.added < self.count {
            if self.index >= self.to && (self.index - self.to) % self.total == 0 {
                self.index = self.index - self.count + self.total;
            }
            let index = self.index;
            self.index += 1;

            let key = format!("{}:{}", self.prefix, index);
            if let Some(range) = self.slot_range {
                if !range.contains(slot_of(key.as_bytes())) {
                    continue;
                }
            }
            self.added += 1;
            return Some((index, key));
        }
        None
    }
}

/// Key indices destined for one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulateBatch {
    pub db: DbIndex,
    pub index: Vec<u64>,
}

impl PopulateBatch {
    pub fn new(db: DbIndex) -> Self {
        Self {
            db,
            index: Vec::with_capacity(BATCH_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// One pending batch per shard
pub struct ShardBatcher {
    db: DbIndex,
    batches: Vec<PopulateBatch>,
}

impl ShardBatcher {
    pub fn new(shard_count: usize, db: DbIndex) -> Self {
        Self {
            db,
            batches: (0..shard_count).map(|_| PopulateBatch::new(db)).collect(),
        }
    }

    /// Appends `index` to the shard's batch; returns the batch once it is full
    pub fn push(&mut self, sid: ShardId, index: u64) -> Option<PopulateBatch> {
        let batch = &mut self.batches[sid as usize];
        batch.index.push(index);
        if batch.len() == BATCH_CAPACITY {
            Some(std::mem::replace(batch, PopulateBatch::new(self.db)))
        } else {
            None
        }
    }

    /// Remaining partial batches, indexed by shard id
    pub fn drain(self) -> Vec<PopulateBatch> {
        self.batches
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

fn generate_value<R: Rng>(size: usize, random: bool, rng: &mut R) -> Bytes {
    if random {
        (0..size)
            .map(|_| HEX[rng.random_range(0..HEX.len())])
            .collect::<Vec<u8>>()
            .into()
    } else {
        Bytes::from(vec![b'x'; size])
    }
}

/// Command name and arguments (key first) that write `key`
pub fn generate_command<R: Rng>(
    options: &PopulateOptions,
    key: String,
    rng: &mut R,
) -> (&'static str, Vec<Bytes>) {
    let size = options.val_size;
    let random = options.random_values;
    let elements = options.elements as usize;
    let mut args = vec![Bytes::from(key)];

    match options.kind {
        PopulateType::String => args.push(generate_value(size, random, rng)),
        PopulateType::List | PopulateType::Set => {
            for _ in 0..elements {
                args.push(generate_value(size, random, rng));
            }
        }
        PopulateType::Hash => {
            for _ in 0..elements {
                args.push(generate_value(size / 2, random, rng));
                args.push(generate_value(size / 2, random, rng));
            }
        }
        PopulateType::ZSet => {
            for _ in 0..elements {
                let score = rng.random::<u64>() % size.max(1) as u64;
                args.push(Bytes::from(score.to_string()));
                args.push(generate_value(size, random, rng));
            }
        }
        PopulateType::Json => {
            args.push(Bytes::from_static(b"$"));
            let fields: Vec<String> = (0..elements)
                .map(|i| {
                    let value = generate_value(size, random, rng);
                    format!("\"{}\":\"{}\"", i, String::from_utf8_lossy(&value))
                })
                .collect();
            args.push(Bytes::from(format!("{{{}}}", fields.join(","))));
        }
    }

    (options.kind.command_name(), args)
}

/// Applies one batch on its shard; returns the number of keys written
///
/// A command that cannot be resolved abandons the rest of the batch.
pub(crate) fn run_batch(
    shard: &EngineShard,
    registry: &CommandRegistry,
    options: &PopulateOptions,
    batch: &PopulateBatch,
) -> usize {
    let mut tx = StubTransaction::new(shard, batch.db);
    let mut rng = rand::rng();
    let mut written = 0;

    for &index in &batch.index {
        let key = format!("{}:{}", options.prefix, index);
        let (name, args) = generate_command(options, key, &mut rng);
        let Some(cid) = registry.find(name) else {
            RESOLUTION_FAILURES_TOTAL.inc();
            if let Some(occurrences) = RESOLUTION_FAILURE_LOG.tick() {
                warn!(command = name, occurrences, "Unable to find command, was it renamed?");
            }
            break;
        };
        match tx.invoke(&cid, &args) {
            Ok(_) => written += 1,
            Err(e) => {
                debug!(shard = shard.shard_id(), command = name, error = %e, "Populate command failed")
            }
        }
    }

    POPULATE_KEYS_TOTAL.inc_by(written as u64);
    written
}

async fn populate_range(
    shard_set: Arc<ShardSet>,
    registry: Arc<CommandRegistry>,
    options: Arc<PopulateOptions>,
    db: DbIndex,
    from: u64,
    count: u64,
) -> Result<()> {
    debug!(from, to = from + count, "Populating range");
    let shard_count = shard_set.size();
    let mut batcher = ShardBatcher::new(shard_count, db);
    let mut dispatched = 0u64;

    for (index, key) in RangeWalker::new(&options, from, count) {
        let sid = shard_of(key.as_bytes(), shard_count);
        let Some(batch) = batcher.push(sid, index) else {
            continue;
        };

        let registry = Arc::clone(&registry);
        let opts = Arc::clone(&options);
        shard_set.add(sid, move |shard| {
            run_batch(shard, &registry, &opts, &batch);
        })?;
        POPULATE_BATCHES_TOTAL.inc();

        dispatched += 1;
        if dispatched % YIELD_EVERY_BATCHES == 0 {
            yield_now().await;
        }
    }

    // Per-shard queues are FIFO: the flush completes after every batch this
    // worker queued on the same shard.
    let slots = batcher
        .drain()
        .into_iter()
        .enumerate()
        .map(|(sid, batch)| {
            let registry = Arc::clone(&registry);
            let opts = Arc::clone(&options);
            shard_set.dispatch(sid as ShardId, move |shard| {
                run_batch(shard, &registry, &opts, &batch)
            })
        })
        .collect();
    join_slots(slots).await?;
    Ok(())
}

/// Generates `options.total_count` keys across `workers` concurrent workers
///
/// Returns once every worker has flushed every shard. Not atomic: on failure
/// the batches already applied stay.
pub async fn populate(
    shard_set: Arc<ShardSet>,
    registry: Arc<CommandRegistry>,
    options: PopulateOptions,
    db: DbIndex,
    workers: usize,
) -> Result<()> {
    let options = Arc::new(options);
    let handles: Vec<_> = split_ranges(options.total_count, workers)
        .into_iter()
        .map(|(from, count)| {
            tokio::spawn(populate_range(
                Arc::clone(&shard_set),
                Arc::clone(&registry),
                Arc::clone(&options),
                db,
                from,
                count,
            ))
        })
        .collect();

    let mut failure = None;
    for handle in handles {
        let outcome = handle
            .await
            .map_err(|e| Error::Internal(format!("populate worker failed: {}", e)))
            .and_then(|r| r);
        if let Err(e) = outcome {
            failure.get_or_insert(e);
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn args(items: &[&str]) -> Vec<Bytes> {
        items
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect()
    }

    #[test]
    fn test_parse_defaults_and_options() -> Result<()> {
        let opts = PopulateOptions::parse(&args(&["100"]))?;
        assert_eq!(opts.total_count, 100);
        assert_eq!(opts.prefix, "key");
        assert_eq!(opts.val_size, DEFAULT_VALUE_SIZE);
        assert_eq!(opts.kind, PopulateType::String);

        let opts = PopulateOptions::parse(&args(&[
            "10", "p", "8", "rand", "TYPE", "zset", "ELEMENTS", "4", "SLOTS", "0", "100",
        ]))?;
        assert!(opts.random_values);
        assert_eq!(opts.kind, PopulateType::ZSet);
        assert_eq!(opts.elements, 4);
        assert_eq!(opts.slot_range, Some(SlotRange { start: 0, end: 100 }));
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        let err = |a: &[&str]| PopulateOptions::parse(&args(a)).err();
        assert!(matches!(err(&[]), Some(Error::UnknownSubcommand(..))));
        assert!(matches!(err(&["x"]), Some(Error::InvalidInt)));
        assert!(matches!(err(&["1", "k", "big"]), Some(Error::InvalidInt)));
        assert!(matches!(err(&["1", "k", "1", "TYPE"]), Some(Error::Syntax)));
        assert!(matches!(err(&["1", "k", "1", "TYPE", "STREAM"]), Some(Error::Syntax)));
        assert!(matches!(err(&["1", "k", "1", "ELEMENTS", "x"]), Some(Error::Syntax)));
        assert!(matches!(err(&["1", "k", "1", "SLOTS", "0"]), Some(Error::Syntax)));
        assert!(matches!(err(&["1", "k", "1", "SLOTS", "a", "1"]), Some(Error::InvalidInt)));
        assert!(matches!(err(&["1", "k", "1", "SLOTS", "0", "16384"]), Some(Error::InvalidValue(_))));
        assert!(matches!(err(&["1", "k", "1", "SLOTS", "5", "4"]), Some(Error::InvalidValue(_))));
        assert!(matches!(err(&["1", "k", "1", "BOGUS"]), Some(Error::Syntax)));
    }

    #[test]
    fn test_split_ranges() {
        assert_eq!(split_ranges(10, 3), vec![(0, 3), (3, 3), (6, 4)]);
        assert_eq!(split_ranges(2, 4), vec![(0, 0), (0, 0), (0, 0), (0, 2)]);
        assert_eq!(split_ranges(7, 1), vec![(0, 7)]);
    }

    #[test]
    fn test_workers_are_disjoint_and_cover_all() {
        for (total, workers) in [(1000u64, 4usize), (97, 5), (3, 8)] {
            let opts = PopulateOptions {
                total_count: total,
                ..Default::default()
            };
            let mut seen = HashSet::new();
            for (from, count) in split_ranges(total, workers) {
                for (index, _) in RangeWalker::new(&opts, from, count) {
                    assert!(seen.insert(index), "index {} produced twice", index);
                }
            }
            assert_eq!(seen, (0..total).collect::<HashSet<_>>());
        }
    }

    #[test]
    fn test_slot_filtered_walk_stays_disjoint() {
        let range = SlotRange { start: 0, end: 100 };
        let opts = PopulateOptions {
            total_count: 100,
            slot_range: Some(range),
            ..Default::default()
        };
        let mut keys = HashSet::new();
        for (from, count) in split_ranges(100, 3) {
            let produced: Vec<_> = RangeWalker::new(&opts, from, count).collect();
            assert_eq!(produced.len() as u64, count);
            for (index, key) in produced {
                let offset = index % opts.total_count;
                assert!(offset >= from && offset < from + count);
                assert!(range.contains(slot_of(key.as_bytes())));
                assert!(keys.insert(key));
            }
        }
        assert_eq!(keys.len(), 100);
    }

    #[test]
    fn test_batches_never_exceed_capacity() {
        let mut batcher = ShardBatcher::new(3, 0);
        let mut full = Vec::new();
        for i in 0..1000u64 {
            if let Some(batch) = batcher.push((i % 3) as ShardId, i) {
                full.push(batch);
            }
        }
        assert!(full.iter().all(|b| b.len() == BATCH_CAPACITY));
        let rest = batcher.drain();
        assert_eq!(rest.len(), 3);
        assert!(rest.iter().all(|b| b.len() < BATCH_CAPACITY));
        let total: usize = full.iter().chain(rest.iter()).map(|b| b.len()).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_generate_commands() {
        let mut rng = rand::rng();
        let mut opts = PopulateOptions {
            val_size: 10,
            elements: 3,
            ..Default::default()
        };

        let (name, a) = generate_command(&opts, "key:1".into(), &mut rng);
        assert_eq!(name, "SET");
        assert_eq!(a, args(&["key:1", "xxxxxxxxxx"]));

        opts.kind = PopulateType::Hash;
        let (name, a) = generate_command(&opts, "h".into(), &mut rng);
        assert_eq!(name, "HSET");
        assert_eq!(a.len(), 7);
        assert!(a[1..].iter().all(|v| v.len() == 5));

        opts.kind = PopulateType::ZSet;
        let (_, a) = generate_command(&opts, "z".into(), &mut rng);
        for pair in a[1..].chunks(2) {
            let score: u64 = std::str::from_utf8(&pair[0]).unwrap().parse().unwrap();
            assert!(score < 10);
        }

        opts.kind = PopulateType::Json;
        opts.random_values = true;
        let (name, a) = generate_command(&opts, "j".into(), &mut rng);
        assert_eq!(name, "JSON.SET");
        let doc: serde_json::Value = serde_json::from_slice(&a[2]).unwrap();
        assert_eq!(doc.as_object().map(|o| o.len()), Some(3));
        let v = doc["1"].as_str().unwrap();
        assert_eq!(v.len(), 10);
        assert!(v.bytes().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        opts.elements = 0;
        let (_, a) = generate_command(&opts, "j".into(), &mut rng);
        assert_eq!(a[2], Bytes::from_static(b"{}"));
    }

    #[test]
    fn test_run_batch_stops_on_unresolved_command() {
        let shard = EngineShard::new(0, 16);
        let registry = CommandRegistry::with_defaults();
        let opts = PopulateOptions::default();
        let batch = PopulateBatch {
            db: 0,
            index: vec![1, 2, 3],
        };
        assert_eq!(run_batch(&shard, &registry, &opts, &batch), 3);

        registry.rename("SET", "SET2").ok();
        let batch = PopulateBatch {
            db: 0,
            index: vec![4, 5],
        };
        assert_eq!(run_batch(&shard, &registry, &opts, &batch), 0);
        assert_eq!(shard.db_slice().stats().db_stats[0].key_count, 3);
    }
}
