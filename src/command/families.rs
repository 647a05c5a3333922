//! Built-in command handlers
//!
//! Every handler runs on the shard that owns its key and touches only that
//! shard's [`DbSlice`](crate::storage::DbSlice).

use super::registry::{CommandId, CommandRegistry, OpArgs};
use super::reply::Reply;
use crate::error::{Error, Result};
use crate::storage::{now_ms, parse_int, ExpirePeriod, ObjType, PrimeValue};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

pub(crate) fn register_all(registry: &CommandRegistry) {
    registry.register(CommandId::new("SET", -3, set));
    registry.register(CommandId::new("GET", 2, get));
    registry.register(CommandId::new("DEL", -2, del));
    registry.register(CommandId::new("LPUSH", -3, lpush));
    registry.register(CommandId::new("SADD", -3, sadd));
    registry.register(CommandId::new("HSET", -4, hset));
    registry.register(CommandId::new("ZADD", -4, zadd));
    registry.register(CommandId::new("JSON.SET", -4, json_set));
}

fn arg_int(arg: &Bytes) -> Result<i64> {
    parse_int(arg).ok_or(Error::InvalidInt)
}

/// SET key value [EX seconds | PX milliseconds]
fn set(op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
    let key = &args[0];
    let mut expire = None;
    let mut i = 2;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_uppercase();
        let sec_precision = match opt.as_str() {
            "EX" => true,
            "PX" => false,
            _ => return Err(Error::Syntax),
        };
        if expire.is_some() || i + 1 >= args.len() {
            return Err(Error::Syntax);
        }
        let amount = arg_int(&args[i + 1])?;
        if amount <= 0 {
            return Err(Error::InvalidValue(
                "invalid expire time in 'set' command".to_string(),
            ));
        }
        let delta_ms = if sec_precision {
            amount.saturating_mul(1000)
        } else {
            amount
        };
        expire = Some(ExpirePeriod {
            at_ms: now_ms().saturating_add(delta_ms),
            sec_precision,
        });
        i += 2;
    }

    let mut slice = op.shard.db_slice_mut();
    slice.set(op.db, key, PrimeValue::Str(args[1].clone()))?;
    if let Some(period) = expire {
        slice.set_expire(op.db, key, period)?;
    }
    Ok(Reply::Ok)
}

fn get(op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
    match op.shard.db_slice_mut().find_read(op.db, &args[0]) {
        Some(PrimeValue::Str(s)) => Ok(Reply::Bulk(s.clone())),
        Some(_) => Err(Error::WrongType),
        None => Ok(Reply::Nil),
    }
}

fn del(op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
    let mut slice = op.shard.db_slice_mut();
    let removed = args.iter().filter(|key| slice.del(op.db, key)).count();
    Ok(Reply::Integer(removed as i64))
}

/// LPUSH key element [element ...]
///
/// Wakes the first transaction blocked on the key, if any.
fn lpush(op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
    let key = &args[0];
    let len = op.shard.db_slice_mut().update(
        op.db,
        key,
        || PrimeValue::List(VecDeque::new()),
        |value| match value {
            PrimeValue::List(items) => {
                for item in &args[1..] {
                    items.push_front(item.clone());
                }
                items.len()
            }
            _ => 0,
        },
    )?;
    op.shard.blocking_controller_mut().awaken_key(op.db, key);
    Ok(Reply::Integer(len as i64))
}

fn sadd(op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
    let added = op.shard.db_slice_mut().update(
        op.db,
        &args[0],
        || PrimeValue::Set(HashSet::new()),
        |value| match value {
            PrimeValue::Set(members) => args[1..]
                .iter()
                .filter(|m| members.insert((*m).clone()))
                .count(),
            _ => 0,
        },
    )?;
    Ok(Reply::Integer(added as i64))
}

/// HSET key field value [field value ...]
fn hset(op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
    let pairs = &args[1..];
    if pairs.len() % 2 != 0 {
        return Err(Error::WrongArity("hset".to_string()));
    }
    let added = op.shard.db_slice_mut().update(
        op.db,
        &args[0],
        || PrimeValue::Hash(HashMap::new()),
        |value| match value {
            PrimeValue::Hash(fields) => pairs
                .chunks_exact(2)
                .filter(|kv| fields.insert(kv[0].clone(), kv[1].clone()).is_none())
                .count(),
            _ => 0,
        },
    )?;
    Ok(Reply::Integer(added as i64))
}

/// ZADD key score member [score member ...]
fn zadd(op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
    let pairs = &args[1..];
    if pairs.len() % 2 != 0 {
        return Err(Error::Syntax);
    }
    let mut parsed = Vec::with_capacity(pairs.len() / 2);
    for kv in pairs.chunks_exact(2) {
        let score: f64 = std::str::from_utf8(&kv[0])
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|s: &f64| !s.is_nan())
            .ok_or_else(|| Error::InvalidValue("value is not a valid float".to_string()))?;
        parsed.push((kv[1].clone(), score));
    }

    let added = op.shard.db_slice_mut().update(
        op.db,
        &args[0],
        || PrimeValue::ZSet(BTreeMap::new()),
        |value| match value {
            PrimeValue::ZSet(entries) => parsed
                .into_iter()
                .filter(|(member, score)| entries.insert(member.clone(), *score).is_none())
                .count(),
            _ => 0,
        },
    )?;
    Ok(Reply::Integer(added as i64))
}

/// JSON.SET key path json
///
/// Only the root path (`$` or `.`) is supported.
fn json_set(op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
    if args.len() != 3 {
        return Err(Error::Syntax);
    }
    let key = &args[0];
    if args[1].as_ref() != b"$" && args[1].as_ref() != b"." {
        return Err(Error::InvalidValue(
            "only the root path is supported".to_string(),
        ));
    }
    let doc: serde_json::Value = serde_json::from_slice(&args[2])
        .map_err(|e| Error::InvalidValue(format!("invalid JSON: {}", e)))?;

    let mut slice = op.shard.db_slice_mut();
    if let Some((_, entry)) = slice.peek(op.db, key) {
        if entry.value.obj_type() != ObjType::Json {
            return Err(Error::WrongType);
        }
    }
    slice.set(op.db, key, PrimeValue::Json(doc))?;
    Ok(Reply::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{EngineShard, WatchingTx};
    use crate::storage::Encoding;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn args(items: &[&str]) -> Vec<Bytes> {
        items.iter().map(|s| b(s)).collect()
    }

    #[test]
    fn test_set_get_with_expiry() -> Result<()> {
        let shard = EngineShard::new(0, 16);
        let op = OpArgs { shard: &shard, db: 0 };

        assert_eq!(set(&op, &args(&["k", "v", "EX", "10"]))?, Reply::Ok);
        let period = shard.db_slice().expire_time(0, b"k").expect("expiry set");
        assert!(period.sec_precision);
        assert!(period.at_ms > now_ms());

        assert_eq!(get(&op, &args(&["k"]))?, Reply::Bulk(b("v")));
        assert_eq!(get(&op, &args(&["missing"]))?, Reply::Nil);

        assert!(matches!(set(&op, &args(&["k", "v", "PX"])), Err(Error::Syntax)));
        assert!(matches!(set(&op, &args(&["k", "v", "PX", "x"])), Err(Error::InvalidInt)));
        assert!(matches!(set(&op, &args(&["k", "v", "EX", "0"])), Err(Error::InvalidValue(_))));
        Ok(())
    }

    #[test]
    fn test_containers() -> Result<()> {
        let shard = EngineShard::new(0, 16);
        let op = OpArgs { shard: &shard, db: 0 };

        assert_eq!(lpush(&op, &args(&["l", "a", "b"]))?, Reply::Integer(2));
        assert_eq!(sadd(&op, &args(&["s", "1", "2", "2"]))?, Reply::Integer(2));
        assert_eq!(hset(&op, &args(&["h", "f", "v", "g", "w"]))?, Reply::Integer(2));
        assert_eq!(zadd(&op, &args(&["z", "1.5", "m", "2", "n"]))?, Reply::Integer(2));
        assert_eq!(json_set(&op, &args(&["j", "$", r#"{"0":"x"}"#]))?, Reply::Ok);

        let slice = shard.db_slice();
        let enc = |k: &[u8]| slice.peek(0, k).map(|(_, e)| e.value.encoding());
        assert_eq!(enc(b"l"), Some(Encoding::Quicklist));
        assert_eq!(enc(b"s"), Some(Encoding::Intset));
        assert_eq!(enc(b"h"), Some(Encoding::Listpack));
        assert_eq!(enc(b"z"), Some(Encoding::Listpack));
        assert_eq!(enc(b"j"), Some(Encoding::Json));
        Ok(())
    }

    #[test]
    fn test_wrong_type_and_bad_args() {
        let shard = EngineShard::new(0, 16);
        let op = OpArgs { shard: &shard, db: 0 };
        set(&op, &args(&["k", "v"])).ok();

        assert!(matches!(lpush(&op, &args(&["k", "a"])), Err(Error::WrongType)));
        assert!(matches!(json_set(&op, &args(&["k", "$", "{}"])), Err(Error::WrongType)));
        assert!(matches!(hset(&op, &args(&["h", "f"])), Err(_)));
        assert!(matches!(hset(&op, &args(&["h", "f", "v", "g"])), Err(Error::WrongArity(_))));
        assert!(matches!(zadd(&op, &args(&["z", "abc", "m"])), Err(Error::InvalidValue(_))));
        assert!(matches!(json_set(&op, &args(&["j", "$", "{"])), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn test_lpush_wakes_blocked_transaction() -> Result<()> {
        let shard = EngineShard::new(0, 16);
        let op = OpArgs { shard: &shard, db: 0 };
        shard
            .blocking_controller_mut()
            .add_watched(0, &[&b"queue"[..]], WatchingTx::new(9, "BLPOP"));

        lpush(&op, &args(&["queue", "job"]))?;
        assert!(shard.blocking_controller().watched_keys(0).is_empty());
        assert_eq!(shard.blocking_controller().awakened_transactions().len(), 1);
        Ok(())
    }

    #[test]
    fn test_del_counts_removed() -> Result<()> {
        let shard = EngineShard::new(0, 16);
        let op = OpArgs { shard: &shard, db: 0 };
        set(&op, &args(&["a", "1"]))?;
        set(&op, &args(&["b", "2"]))?;
        assert_eq!(del(&op, &args(&["a", "b", "c"]))?, Reply::Integer(2));
        Ok(())
    }
}
