//! Watch state for blocking commands (BLPOP and friends)

use crate::storage::DbIndex;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Transaction identifier
pub type TxId = u64;

/// A transaction parked on one or more keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchingTx {
    pub id: TxId,
    pub name: String,
}

impl WatchingTx {
    pub fn new(id: TxId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn debug_id(&self) -> String {
        format!("{}@{}", self.name, self.id)
    }
}

/// Per-shard registry of watched keys and of transactions woken up by writes
#[derive(Debug, Default)]
pub struct BlockingController {
    watched: HashMap<DbIndex, BTreeMap<Bytes, VecDeque<WatchingTx>>>,
    awakened: Vec<WatchingTx>,
}

impl BlockingController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `tx` on every key in `keys`
    pub fn add_watched(&mut self, db: DbIndex, keys: &[&[u8]], tx: WatchingTx) {
        let queues = self.watched.entry(db).or_default();
        for key in keys {
            queues
                .entry(Bytes::copy_from_slice(key))
                .or_default()
                .push_back(tx.clone());
        }
    }

    /// Wakes the first transaction waiting on `key`
    ///
    /// The woken transaction stops watching all of its keys. Returns whether
    /// anyone was waiting.
    pub fn awaken_key(&mut self, db: DbIndex, key: &[u8]) -> bool {
        let Some(queues) = self.watched.get_mut(&db) else {
            return false;
        };
        let Some(tx) = queues.get_mut(key).and_then(|q| q.pop_front()) else {
            return false;
        };
        for queue in queues.values_mut() {
            queue.retain(|t| t.id != tx.id);
        }
        queues.retain(|_, q| !q.is_empty());
        self.awakened.push(tx);
        true
    }

    /// Forgets a woken transaction once it has run
    pub fn finalize(&mut self, id: TxId) {
        self.awakened.retain(|t| t.id != id);
    }

    pub fn watched_keys(&self, db: DbIndex) -> Vec<String> {
        self.watched
            .get(&db)
            .map(|queues| {
                queues
                    .keys()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn awakened_transactions(&self) -> &[WatchingTx] {
        &self.awakened
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_awaken_moves_tx_off_all_keys() {
        let mut bc = BlockingController::new();
        bc.add_watched(0, &[&b"a"[..], &b"b"[..]], WatchingTx::new(7, "BLPOP"));
        bc.add_watched(0, &[&b"b"[..]], WatchingTx::new(8, "BLPOP"));
        assert_eq!(bc.watched_keys(0), vec!["a".to_string(), "b".to_string()]);

        assert!(bc.awaken_key(0, b"a"));
        assert_eq!(bc.watched_keys(0), vec!["b".to_string()]);
        assert_eq!(bc.awakened_transactions()[0].debug_id(), "BLPOP@7");

        bc.finalize(7);
        assert!(bc.awakened_transactions().is_empty());
        assert!(!bc.awaken_key(1, b"a"));
    }
}
