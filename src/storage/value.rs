//! Stored values
//!
//! A closed set of container kinds. Everything that branches on the object
//! type (histograms, population, inspection) matches on [`ObjType`] or
//! [`PrimeValue`] so new kinds are caught by exhaustiveness checking.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

/// Sets with at most this many integer members use the compact intset encoding
const MAX_INTSET_ENTRIES: usize = 512;
/// Hashes and sorted sets with at most this many entries use listpack
const MAX_LISTPACK_ENTRIES: usize = 128;
/// Largest element stored inline in a listpack
const MAX_LISTPACK_VALUE: usize = 64;
/// Per-entry bookkeeping overhead used for memory estimates
const ENTRY_OVERHEAD: usize = 16;

/// Object type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjType {
    String,
    List,
    Set,
    ZSet,
    Hash,
    Json,
}

impl ObjType {
    pub fn name(&self) -> &'static str {
        match self {
            ObjType::String => "string",
            ObjType::List => "list",
            ObjType::Set => "set",
            ObjType::ZSet => "zset",
            ObjType::Hash => "hash",
            ObjType::Json => "ReJSON-RL",
        }
    }
}

impl fmt::Display for ObjType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical encoding tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Int,
    Raw,
    Quicklist,
    Intset,
    Listpack,
    Hashtable,
    Skiplist,
    Json,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Int => "int",
            Encoding::Raw => "raw",
            Encoding::Quicklist => "quicklist",
            Encoding::Intset => "intset",
            Encoding::Listpack => "listpack",
            Encoding::Hashtable => "hashtable",
            Encoding::Skiplist => "skiplist",
            Encoding::Json => "json",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One element visited while iterating a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEntry<'a> {
    /// A byte-string element
    Value(&'a [u8]),
    /// An element stored as a packed integer
    Int(i64),
}

/// Value stored under a key
#[derive(Debug, Clone, PartialEq)]
pub enum PrimeValue {
    Str(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    /// member → score
    ZSet(BTreeMap<Bytes, f64>),
    Hash(HashMap<Bytes, Bytes>),
    Json(serde_json::Value),
}

impl PrimeValue {
    pub fn obj_type(&self) -> ObjType {
        match self {
            PrimeValue::Str(_) => ObjType::String,
            PrimeValue::List(_) => ObjType::List,
            PrimeValue::Set(_) => ObjType::Set,
            PrimeValue::ZSet(_) => ObjType::ZSet,
            PrimeValue::Hash(_) => ObjType::Hash,
            PrimeValue::Json(_) => ObjType::Json,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            PrimeValue::Str(s) => {
                if parse_int(s).is_some() {
                    Encoding::Int
                } else {
                    Encoding::Raw
                }
            }
            PrimeValue::List(_) => Encoding::Quicklist,
            PrimeValue::Set(members) => {
                if members.len() <= MAX_INTSET_ENTRIES && members.iter().all(|m| parse_int(m).is_some()) {
                    Encoding::Intset
                } else {
                    Encoding::Hashtable
                }
            }
            PrimeValue::ZSet(entries) => {
                if entries.len() <= MAX_LISTPACK_ENTRIES
                    && entries.keys().all(|m| m.len() <= MAX_LISTPACK_VALUE)
                {
                    Encoding::Listpack
                } else {
                    Encoding::Skiplist
                }
            }
            PrimeValue::Hash(fields) => {
                if fields.len() <= MAX_LISTPACK_ENTRIES
                    && fields
                        .iter()
                        .all(|(f, v)| f.len() <= MAX_LISTPACK_VALUE && v.len() <= MAX_LISTPACK_VALUE)
                {
                    Encoding::Listpack
                } else {
                    Encoding::Hashtable
                }
            }
            PrimeValue::Json(_) => Encoding::Json,
        }
    }

    /// Number of entries for containers, byte length for strings
    pub fn size(&self) -> usize {
        match self {
            PrimeValue::Str(s) => s.len(),
            PrimeValue::List(items) => items.len(),
            PrimeValue::Set(members) => members.len(),
            PrimeValue::ZSet(entries) => entries.len(),
            PrimeValue::Hash(fields) => fields.len(),
            PrimeValue::Json(value) => match value {
                serde_json::Value::Object(obj) => obj.len(),
                serde_json::Value::Array(arr) => arr.len(),
                _ => 1,
            },
        }
    }

    /// Approximate heap footprint in bytes
    pub fn malloc_used(&self) -> usize {
        match self {
            PrimeValue::Str(s) => s.len(),
            PrimeValue::List(items) => items.iter().map(|i| i.len() + ENTRY_OVERHEAD).sum(),
            PrimeValue::Set(members) => members.iter().map(|m| m.len() + ENTRY_OVERHEAD).sum(),
            PrimeValue::ZSet(entries) => entries
                .keys()
                .map(|m| m.len() + std::mem::size_of::<f64>() + ENTRY_OVERHEAD)
                .sum(),
            PrimeValue::Hash(fields) => fields
                .iter()
                .map(|(f, v)| f.len() + v.len() + ENTRY_OVERHEAD)
                .sum(),
            PrimeValue::Json(value) => value.to_string().len(),
        }
    }

    /// Visits every element of a list, set or sorted set
    ///
    /// Stops early when `cb` returns false. Strings, hashes and documents have
    /// no single-element view and are not visited.
    pub fn iterate_entries<F>(&self, mut cb: F)
    where
        F: FnMut(ContainerEntry<'_>) -> bool,
    {
        match self {
            PrimeValue::List(items) => {
                for item in items {
                    if !cb(ContainerEntry::Value(item)) {
                        return;
                    }
                }
            }
            PrimeValue::Set(members) => {
                let packed = self.encoding() == Encoding::Intset;
                for member in members {
                    let entry = match (packed, parse_int(member)) {
                        (true, Some(n)) => ContainerEntry::Int(n),
                        _ => ContainerEntry::Value(member),
                    };
                    if !cb(entry) {
                        return;
                    }
                }
            }
            PrimeValue::ZSet(entries) => {
                for member in entries.keys() {
                    if !cb(ContainerEntry::Value(member)) {
                        return;
                    }
                }
            }
            PrimeValue::Str(_) | PrimeValue::Hash(_) | PrimeValue::Json(_) => {}
        }
    }
}

/// Parses a canonical decimal integer (no leading '+', no leading zeros)
pub fn parse_int(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    let s = std::str::from_utf8(bytes).ok()?;
    let n: i64 = s.parse().ok()?;
    if n.to_string() == s {
        Some(n)
    } else {
        None
    }
}
