//! Reductions over per-shard results
//!
//! Fan-outs return one slot per shard, indexed by shard id. The helpers here
//! fold those slots into a single report: sums, min/max, frequency counts and
//! shard-tagged unions.

use crate::shard::{EngineShard, ShardId, TxQueueInfo};
use crate::storage::DbIndex;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Smallest and largest of a set of values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinMax<T> {
    pub min: T,
    pub max: T,
}

/// `None` for an empty input
pub fn min_max<T, I>(values: I) -> Option<MinMax<T>>
where
    T: Ord + Copy,
    I: IntoIterator<Item = T>,
{
    values.into_iter().fold(None, |acc, v| match acc {
        None => Some(MinMax { min: v, max: v }),
        Some(MinMax { min, max }) => Some(MinMax {
            min: min.min(v),
            max: max.max(v),
        }),
    })
}

/// Cross-shard frequency accumulator
///
/// Shards add their counts concurrently; the mutex is held only for the
/// merge of one shard's map.
#[derive(Debug, Default)]
pub struct FrequencyMerge {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl FrequencyMerge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, shard_counts: HashMap<String, u64>) {
        let mut counts = self.counts.lock();
        for (descriptor, n) in shard_counts {
            *counts.entry(descriptor).or_insert(0) += n;
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts.lock().clone()
    }

    /// `<count>:<descriptor>` lines, sorted by descriptor
    pub fn render(&self) -> String {
        self.counts
            .lock()
            .iter()
            .map(|(descriptor, n)| format!("{}:{}\n", n, descriptor))
            .collect()
    }
}

/// Prefixes an entry with the shard it came from
pub fn tag_with_shard(shard: ShardId, entry: &str) -> String {
    format!("[{}] {}", shard, entry)
}

/// Resource usage of one shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardInfo {
    pub used_memory: usize,
    pub key_count: usize,
    pub expire_count: usize,
    pub key_reads: u64,
}

impl ShardInfo {
    pub fn collect(shard: &EngineShard) -> Self {
        let stats = shard.db_slice().stats();
        let mut info = ShardInfo {
            used_memory: shard.used_memory(),
            key_reads: stats.events.hits + stats.events.misses,
            ..Default::default()
        };
        for db in &stats.db_stats {
            info.key_count += db.key_count;
            info.expire_count += db.expire_count;
        }
        info
    }
}

/// Per-shard lines followed by `max_`/`min_` lines for every stat
pub fn render_shards(infos: &[ShardInfo]) -> String {
    let mut out = format!("num_shards: {}\n", infos.len());
    for (i, info) in infos.iter().enumerate() {
        out.push_str(&format!("shard{}_used_memory: {}\n", i, info.used_memory));
        out.push_str(&format!("shard{}_key_count: {}\n", i, info.key_count));
        out.push_str(&format!("shard{}_expire_count: {}\n", i, info.expire_count));
        out.push_str(&format!("shard{}_key_reads: {}\n", i, info.key_reads));
    }

    let mut push_min_max = |name: &str, extremes: Option<MinMax<u64>>| {
        let mm = extremes.unwrap_or(MinMax { min: 0, max: 0 });
        out.push_str(&format!("max_{}: {}\n", name, mm.max));
        out.push_str(&format!("min_{}: {}\n", name, mm.min));
    };
    push_min_max("used_memory", min_max(infos.iter().map(|i| i.used_memory as u64)));
    push_min_max("key_count", min_max(infos.iter().map(|i| i.key_count as u64)));
    push_min_max("expire_count", min_max(infos.iter().map(|i| i.expire_count as u64)));
    push_min_max("key_reads", min_max(infos.iter().map(|i| i.key_reads)));
    out
}

pub fn render_tx(infos: &[TxQueueInfo]) -> String {
    let mut out = String::new();
    for (i, info) in infos.iter().enumerate() {
        out.push_str(&format!(
            "shard{}:\n  tx armed {}, total: {},global:{},runnable:{}\n",
            i, info.tx_armed, info.tx_total, info.tx_global, info.tx_runnable
        ));
        out.push_str(&format!(
            "  locks total:{},contended:{}\n",
            info.total_locks, info.contended_locks
        ));
        out.push_str(&format!(
            "  max contention score: {},lock_name:{}\n",
            info.max_contention_score, info.max_contention_lock_name
        ));
    }
    out
}

/// Watch state of one shard: woken transactions (already tagged) and watched keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchedInfo {
    pub awakened: Vec<String>,
    pub watched: Vec<String>,
}

impl WatchedInfo {
    pub fn collect(shard: &EngineShard, db: DbIndex) -> Self {
        let bc = shard.blocking_controller();
        WatchedInfo {
            awakened: bc
                .awakened_transactions()
                .iter()
                .map(|tx| tag_with_shard(shard.shard_id(), &tx.debug_id()))
                .collect(),
            watched: bc.watched_keys(db),
        }
    }

    /// Concatenates shard results in shard order
    pub fn union(parts: Vec<WatchedInfo>) -> WatchedInfo {
        parts.into_iter().fold(WatchedInfo::default(), |mut acc, part| {
            acc.awakened.extend(part.awakened);
            acc.watched.extend(part.watched);
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_min_max_bounds_every_value() {
        let values = [7u64, 3, 11, 3, 9];
        let mm = min_max(values).expect("non-empty");
        assert_eq!(mm, MinMax { min: 3, max: 11 });
        assert!(values.iter().all(|v| mm.min <= *v && *v <= mm.max));
        assert!(min_max(Vec::<u64>::new()).is_none());
    }

    #[test]
    fn test_frequency_merge_from_threads() {
        let merge = Arc::new(FrequencyMerge::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let merge = Arc::clone(&merge);
                std::thread::spawn(move || {
                    merge.add(HashMap::from([
                        ("EXEC/1 SET:2".to_string(), 2),
                        ("EXEC/2 GET:1 SET:2".to_string(), 1),
                    ]));
                })
            })
            .collect();
        for h in handles {
            h.join().expect("merge thread");
        }
        assert_eq!(merge.render(), "4:EXEC/2 GET:1 SET:2\n8:EXEC/1 SET:2\n");
    }

    #[test]
    fn test_render_shards() {
        let infos = [
            ShardInfo {
                used_memory: 100,
                key_count: 5,
                expire_count: 1,
                key_reads: 0,
            },
            ShardInfo {
                used_memory: 40,
                key_count: 9,
                expire_count: 0,
                key_reads: 3,
            },
        ];
        let text = render_shards(&infos);
        assert!(text.starts_with("num_shards: 2\nshard0_used_memory: 100\n"));
        assert!(text.contains("shard1_key_count: 9\n"));
        assert!(text.contains("max_used_memory: 100\nmin_used_memory: 40\n"));
        assert!(text.contains("max_key_count: 9\nmin_key_count: 5\n"));
        assert!(text.ends_with("max_key_reads: 3\nmin_key_reads: 0\n"));
    }

    #[test]
    fn test_render_tx() {
        let info = TxQueueInfo {
            tx_armed: 1,
            tx_total: 2,
            tx_global: 0,
            tx_runnable: 1,
            total_locks: 3,
            contended_locks: 1,
            max_contention_score: 257,
            max_contention_lock_name: "hot".to_string(),
        };
        assert_eq!(
            render_tx(&[info]),
            "shard0:\n  tx armed 1, total: 2,global:0,runnable:1\n  locks total:3,contended:1\n  max contention score: 257,lock_name:hot\n"
        );
    }

    #[test]
    fn test_watched_union_keeps_shard_order() {
        let parts = vec![
            WatchedInfo {
                awakened: vec![tag_with_shard(0, "BLPOP@1")],
                watched: vec!["a".into()],
            },
            WatchedInfo {
                awakened: vec![],
                watched: vec!["b".into(), "c".into()],
            },
        ];
        let all = WatchedInfo::union(parts);
        assert_eq!(all.awakened, vec!["[0] BLPOP@1".to_string()]);
        assert_eq!(all.watched, vec!["a", "b", "c"]);
    }
}
