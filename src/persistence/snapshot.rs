use super::Persistence;
use crate::error::{Error, Result};
use crate::shard::{join_slots, shard_of, EngineShard, ShardId, ShardSet};
use crate::storage::{now_ms, DbIndex, ExpirePeriod, PrimeValue};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable form of a stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotValue {
    Str(Bytes),
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    ZSet(#[serde(with = "zset_scores")] Vec<(Bytes, f64)>),
    Hash(Vec<(Bytes, Bytes)>),
    Json(serde_json::Value),
}

/// ZSET scores as JSON numbers, with `"inf"`/`"-inf"` for the infinities
/// JSON has no literal for
mod zset_scores {
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Score {
        Finite(f64),
        Named(String),
    }

    pub fn serialize<S: Serializer>(entries: &[(Bytes, f64)], serializer: S) -> Result<S::Ok, S::Error> {
        entries
            .iter()
            .map(|(member, score)| {
                let score = match *score {
                    s if s.is_finite() => Score::Finite(s),
                    s if s > 0.0 => Score::Named("inf".to_string()),
                    _ => Score::Named("-inf".to_string()),
                };
                (member, score)
            })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(Bytes, f64)>, D::Error> {
        Vec::<(Bytes, Score)>::deserialize(deserializer)?
            .into_iter()
            .map(|(member, score)| {
                let score = match score {
                    Score::Finite(s) => s,
                    Score::Named(name) => match name.as_str() {
                        "inf" => f64::INFINITY,
                        "-inf" => f64::NEG_INFINITY,
                        other => return Err(de::Error::custom(format!("invalid score '{}'", other))),
                    },
                };
                Ok((member, score))
            })
            .collect()
    }
}

impl From<&PrimeValue> for SnapshotValue {
    fn from(value: &PrimeValue) -> Self {
        match value {
            PrimeValue::Str(s) => SnapshotValue::Str(s.clone()),
            PrimeValue::List(items) => SnapshotValue::List(items.iter().cloned().collect()),
            PrimeValue::Set(members) => SnapshotValue::Set(members.iter().cloned().collect()),
            PrimeValue::ZSet(entries) => {
                SnapshotValue::ZSet(entries.iter().map(|(m, s)| (m.clone(), *s)).collect())
            }
            PrimeValue::Hash(fields) => SnapshotValue::Hash(
                fields
                    .iter()
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect(),
            ),
            PrimeValue::Json(doc) => SnapshotValue::Json(doc.clone()),
        }
    }
}

impl From<SnapshotValue> for PrimeValue {
    fn from(value: SnapshotValue) -> Self {
        match value {
            SnapshotValue::Str(s) => PrimeValue::Str(s),
            SnapshotValue::List(items) => PrimeValue::List(VecDeque::from(items)),
            SnapshotValue::Set(members) => PrimeValue::Set(members.into_iter().collect::<HashSet<_>>()),
            SnapshotValue::ZSet(entries) => PrimeValue::ZSet(entries.into_iter().collect::<BTreeMap<_, _>>()),
            SnapshotValue::Hash(fields) => PrimeValue::Hash(fields.into_iter().collect::<HashMap<_, _>>()),
            SnapshotValue::Json(doc) => PrimeValue::Json(doc),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub db: DbIndex,
    pub key: Bytes,
    pub value: SnapshotValue,
    pub expire_at_ms: Option<i64>,
    #[serde(default)]
    pub sec_precision: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry>,
}

fn dump_shard(shard: &EngineShard) -> Vec<SnapshotEntry> {
    let slice = shard.db_slice();
    let mut entries = Vec::new();
    for db in 0..slice.db_array_size() {
        let db = db as DbIndex;
        let Some(table) = slice.db_table(db) else {
            continue;
        };
        for (key, entry) in table.prime.iter() {
            let expire = table.expire.get(key);
            entries.push(SnapshotEntry {
                db,
                key: key.clone(),
                value: SnapshotValue::from(&entry.value),
                expire_at_ms: expire.map(|e| e.at_ms),
                sec_precision: expire.is_some_and(|e| e.sec_precision),
            });
        }
    }
    entries
}

/// Restores entries on their owning shard; already-expired keys are skipped
fn restore_shard(shard: &EngineShard, entries: Vec<SnapshotEntry>) -> Result<usize> {
    let now = now_ms();
    let mut slice = shard.db_slice_mut();
    let mut restored = 0;
    for entry in entries {
        if entry.expire_at_ms.is_some_and(|at| at <= now) {
            continue;
        }
        slice.set(entry.db, &entry.key, entry.value.into())?;
        if let Some(at_ms) = entry.expire_at_ms {
            slice.set_expire(
                entry.db,
                &entry.key,
                ExpirePeriod {
                    at_ms,
                    sec_precision: entry.sec_precision,
                },
            )?;
        }
        restored += 1;
    }
    Ok(restored)
}

/// JSON snapshot in `dir/dbfilename`
#[derive(Debug)]
pub struct SnapshotPersistence {
    dir: PathBuf,
    dbfilename: String,
    last_save: Mutex<Option<PathBuf>>,
}

impl SnapshotPersistence {
    pub fn new(dir: impl Into<PathBuf>, dbfilename: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            dbfilename: dbfilename.into(),
            last_save: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Persistence for SnapshotPersistence {
    async fn save(&self, shard_set: &ShardSet) -> Result<PathBuf> {
        let per_shard = shard_set.run_brief_in_parallel(dump_shard).await?;
        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION,
            created_at: Utc::now(),
            entries: per_shard.into_iter().flatten().collect(),
        };
        let data = serde_json::to_vec(&snapshot)
            .map_err(|e| Error::Serialization(format!("Failed to encode snapshot: {}", e)))?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Persistence(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;
        let path = self.default_path();
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to rename {}: {}", tmp.display(), e)))?;

        info!(
            path = %path.display(),
            keys = snapshot.entries.len(),
            bytes = data.len(),
            "Snapshot saved"
        );
        *self.last_save.lock() = Some(path.clone());
        Ok(path)
    }

    async fn load(&self, shard_set: &ShardSet, path: &Path) -> Result<usize> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            Error::Persistence(format!("Could not load file {}: {}", path.display(), e))
        })?;
        let snapshot: SnapshotFile = serde_json::from_slice(&data)
            .map_err(|e| Error::Serialization(format!("Invalid snapshot {}: {}", path.display(), e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Persistence(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let shard_count = shard_set.size();
        let mut groups: Vec<Vec<SnapshotEntry>> = (0..shard_count).map(|_| Vec::new()).collect();
        for entry in snapshot.entries {
            groups[shard_of(&entry.key, shard_count) as usize].push(entry);
        }

        let slots = groups
            .into_iter()
            .enumerate()
            .map(|(sid, entries)| {
                shard_set.dispatch(sid as ShardId, move |shard| restore_shard(shard, entries))
            })
            .collect();
        let restored: usize = join_slots(slots)
            .await?
            .into_iter()
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .sum();

        debug!(path = %path.display(), restored, "Snapshot loaded");
        Ok(restored)
    }

    fn last_save_file(&self) -> Option<PathBuf> {
        self.last_save.lock().clone()
    }

    fn default_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shardkv_{}_{}", name, std::process::id()))
    }

    #[test]
    fn test_value_conversion_round_trip() {
        let values = vec![
            PrimeValue::Str(Bytes::from_static(b"\x00\xffbin")),
            PrimeValue::List(VecDeque::from(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])),
            PrimeValue::ZSet(BTreeMap::from([
                (Bytes::from_static(b"m"), 1.5),
                (Bytes::from_static(b"hi"), f64::INFINITY),
                (Bytes::from_static(b"lo"), f64::NEG_INFINITY),
            ])),
            PrimeValue::Hash(HashMap::from([(Bytes::from_static(b"f"), Bytes::from_static(b"v"))])),
            PrimeValue::Json(serde_json::json!({"0": "x"})),
        ];
        for value in values {
            let snap = SnapshotValue::from(&value);
            let encoded = serde_json::to_string(&snap).expect("encode");
            let decoded: SnapshotValue = serde_json::from_str(&encoded).expect("decode");
            assert_eq!(PrimeValue::from(decoded), value);
        }
    }

    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let dir = temp_dir("snapshot");
        let persistence = SnapshotPersistence::new(&dir, "dump.json");
        let shards = ShardSet::new(2, 4)?;

        for i in 0..50u32 {
            let key = format!("k{}", i);
            let sid = shard_of(key.as_bytes(), shards.size());
            shards
                .await_on(sid, move |shard| {
                    let mut slice = shard.db_slice_mut();
                    slice.set((i % 2) as DbIndex, key.as_bytes(), PrimeValue::Str(Bytes::from(i.to_string())))?;
                    if i == 0 {
                        slice.set_expire(
                            0,
                            key.as_bytes(),
                            ExpirePeriod {
                                at_ms: now_ms() + 60_000,
                                sec_precision: true,
                            },
                        )?;
                    }
                    Ok::<_, Error>(())
                })
                .await??;
        }

        assert!(persistence.last_save_file().is_none());
        let path = persistence.save(&shards).await?;
        assert_eq!(persistence.last_save_file(), Some(path.clone()));

        shards.run_brief_in_parallel(|shard| shard.db_slice_mut().flush_all()).await?;
        let restored = persistence.load(&shards, &path).await?;
        assert_eq!(restored, 50);

        let sid = shard_of(b"k0", shards.size());
        let expire = shards
            .await_on(sid, |shard| shard.db_slice().expire_time(0, b"k0"))
            .await?;
        assert!(expire.is_some_and(|e| e.sec_precision));

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_zset_rejects_unknown_score_name() {
        let encoded = r#"{"ZSet":[[[109],"nan"]]}"#;
        assert!(serde_json::from_str::<SnapshotValue>(encoded).is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file() -> Result<()> {
        let persistence = SnapshotPersistence::new(temp_dir("missing"), "none.json");
        let shards = ShardSet::new(1, 1)?;
        let err = persistence
            .load(&shards, &persistence.default_path())
            .await
            .err();
        assert!(matches!(err, Some(Error::Persistence(_))));
        Ok(())
    }
}
