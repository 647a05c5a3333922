//! Per-object-type size histograms

use super::histogram::Histogram;
use crate::shard::{yield_now, EngineShard};
use crate::storage::{ContainerEntry, Cursor, DbIndex, ObjType, PrimeValue};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Traversal steps between voluntary yields
pub const YIELD_STEPS: usize = 20_000;

/// Bytes accounted for an integer-packed set member
const PACKED_INT_LEN: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjHist {
    pub key_len: Histogram,
    /// Overall size of the value
    pub val_len: Histogram,
    /// Number of entries, containers only
    pub card: Histogram,
    /// Length of each entry, containers only
    pub entry_len: Histogram,
}

impl ObjHist {
    pub fn merge(&mut self, other: &ObjHist) {
        self.key_len.merge(&other.key_len);
        self.val_len.merge(&other.val_len);
        self.card.merge(&other.card);
        self.entry_len.merge(&other.entry_len);
    }

    /// Records one key/value pair; returns the number of unit steps taken
    pub fn add(&mut self, key: &[u8], value: &PrimeValue) -> usize {
        let mut steps = 1;
        let mut val_len = 0usize;

        self.key_len.add(key.len() as u64);

        match value {
            PrimeValue::List(_) | PrimeValue::Set(_) | PrimeValue::ZSet(_) => {
                value.iterate_entries(|entry| {
                    match entry {
                        ContainerEntry::Value(v) => {
                            val_len += v.len();
                            self.entry_len.add(v.len() as u64);
                        }
                        ContainerEntry::Int(_) => val_len += PACKED_INT_LEN,
                    }
                    steps += 1;
                    true
                });
            }
            PrimeValue::Hash(fields) => {
                for (field, v) in fields {
                    self.entry_len.add((field.len() + v.len()) as u64);
                    steps += 1;
                }
                val_len = value.malloc_used();
            }
            PrimeValue::Str(_) | PrimeValue::Json(_) => {}
        }

        if val_len == 0 {
            val_len = value.malloc_used();
        }
        self.val_len.add(val_len as u64);

        match value.obj_type() {
            ObjType::String | ObjType::Json => {}
            _ => self.card.add(value.size() as u64),
        }

        steps
    }
}

pub type ObjHistMap = BTreeMap<ObjType, ObjHist>;

/// Folds `src` into `dest`, type by type
pub fn merge_obj_hist_map(src: ObjHistMap, dest: &mut ObjHistMap) {
    for (obj_type, hist) in src {
        match dest.get_mut(&obj_type) {
            Some(existing) => existing.merge(&hist),
            None => {
                dest.insert(obj_type, hist);
            }
        }
    }
}

/// Walks every database of `shard`, yielding every [`YIELD_STEPS`] steps
///
/// The table may change between yields; the cursor guarantees entries present
/// for the whole walk are visited exactly once.
pub async fn build_obj_hist(shard: Rc<EngineShard>) -> ObjHistMap {
    let mut map = ObjHistMap::new();
    let mut steps = 0usize;
    let db_count = shard.db_slice().db_array_size();

    for db in 0..db_count {
        let mut cursor = Cursor::default();
        loop {
            let next = {
                let slice = shard.db_slice();
                let Some(table) = slice.db_table(db as DbIndex) else {
                    break;
                };
                table.prime.traverse(cursor, |key, entry| {
                    steps += map
                        .entry(entry.value.obj_type())
                        .or_default()
                        .add(key, &entry.value);
                })
            };
            cursor = next;

            if steps >= YIELD_STEPS {
                steps = 0;
                yield_now().await;
            }
            if cursor.is_done() {
                break;
            }
        }
    }

    map
}

/// Text report of a merged map
pub fn render(map: &ObjHistMap) -> String {
    let mut out = String::from("___begin object histogram___\n\n");
    for (obj_type, hist) in map {
        out.push_str(&format!("OBJECT:{}\n", obj_type));
        out.push_str(&"_".repeat(64));
        out.push('\n');
        out.push_str(&format!("Key length histogram:\n{}\n", hist.key_len));
        out.push_str(&format!("Value length histogram:\n{}\n", hist.val_len));
        out.push_str(&format!("Cardinality histogram:\n{}\n", hist.card));
        out.push_str(&format!("Entry length histogram:\n{}\n", hist.entry_len));
    }
    out.push_str("___end object histogram___\n");
    out
}
