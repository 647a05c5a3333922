use super::GlobalState;
use crate::command::{CommandId, CommandRegistry, OpArgs, Reply};
use crate::config::ServerConfig;
use crate::debug::DebugCmd;
use crate::error::{Error, Result};
use crate::persistence::{Persistence, SnapshotPersistence};
use crate::shard::{join_slots, shard_of, ShardId, ShardSet, TxId, TxQueueEntry, WatchingTx};
use crate::storage::{DbIndex, LockMode};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// In-process ShardKV instance
pub struct Service {
    config: ServerConfig,
    shard_set: Arc<ShardSet>,
    registry: Arc<CommandRegistry>,
    persistence: Arc<dyn Persistence>,
    state: Mutex<GlobalState>,
    next_txid: AtomicU64,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Service {
    /// Starts the shards and uses a JSON snapshot in `config.dir`
    pub fn new(config: ServerConfig) -> Result<Self> {
        let persistence = Arc::new(SnapshotPersistence::new(
            config.dir.clone(),
            config.dbfilename.clone(),
        ));
        Self::with_persistence(config, persistence)
    }

    pub fn with_persistence(config: ServerConfig, persistence: Arc<dyn Persistence>) -> Result<Self> {
        config.validate()?;
        crate::metrics::init_metrics();

        let shard_set = Arc::new(ShardSet::new(config.shard_count, config.max_databases)?);
        info!(
            shards = config.shard_count,
            workers = config.worker_count,
            "Service started"
        );

        Ok(Self {
            config,
            shard_set,
            registry: Arc::new(CommandRegistry::with_defaults()),
            persistence,
            state: Mutex::new(GlobalState::Active),
            next_txid: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn shard_set(&self) -> &Arc<ShardSet> {
        &self.shard_set
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn global_state(&self) -> GlobalState {
        *self.state.lock()
    }

    /// Moves from `from` to `to`; on mismatch returns the current state
    pub fn switch_state(&self, from: GlobalState, to: GlobalState) -> std::result::Result<(), GlobalState> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(*state);
        }
        *state = to;
        Ok(())
    }

    fn next_txid(&self) -> TxId {
        self.next_txid.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs one command; `args[0]` is the command name
    pub async fn execute(&self, db: DbIndex, args: &[Bytes]) -> Reply {
        match self.dispatch(db, args).await {
            Ok(reply) => reply,
            Err(e) => e.into(),
        }
    }

    async fn dispatch(&self, db: DbIndex, args: &[Bytes]) -> Result<Reply> {
        let Some(name) = args.first() else {
            return Err(Error::CommandNotFound(String::new()));
        };
        let name = String::from_utf8_lossy(name).to_uppercase();

        if name == "DEBUG" {
            if args.len() < 2 {
                return Err(Error::WrongArity("debug".to_string()));
            }
            return Ok(DebugCmd::new(self, db).run(&args[1..]).await);
        }

        let cid = self
            .registry
            .find(&name)
            .ok_or_else(|| Error::CommandNotFound(name.to_lowercase()))?;
        self.run_resolved(db, cid, &args[1..]).await
    }

    async fn run_resolved(&self, db: DbIndex, cid: Arc<CommandId>, args: &[Bytes]) -> Result<Reply> {
        if cid.name() == "DEL" {
            return self.del(db, cid, args).await;
        }
        self.execute_on_owner(db, cid, args).await
    }

    /// Runs `cid` on the shard owning `args[0]`
    async fn execute_on_owner(&self, db: DbIndex, cid: Arc<CommandId>, args: &[Bytes]) -> Result<Reply> {
        let Some(key) = args.first() else {
            return Err(Error::WrongArity(cid.name().to_lowercase()));
        };
        let sid = shard_of(key, self.shard_set.size());
        let args = args.to_vec();
        self.shard_set
            .await_on(sid, move |shard| cid.invoke(&OpArgs { shard, db }, &args))
            .await?
    }

    /// Multi-key DEL: one sub-command per owning shard, counts summed
    async fn del(&self, db: DbIndex, cid: Arc<CommandId>, keys: &[Bytes]) -> Result<Reply> {
        if keys.is_empty() {
            return Err(Error::WrongArity("del".to_string()));
        }
        let mut per_shard: BTreeMap<ShardId, Vec<Bytes>> = BTreeMap::new();
        for key in keys {
            per_shard
                .entry(shard_of(key, self.shard_set.size()))
                .or_default()
                .push(key.clone());
        }

        let slots = per_shard
            .into_iter()
            .map(|(sid, keys)| {
                let cid = Arc::clone(&cid);
                self.shard_set
                    .dispatch(sid, move |shard| cid.invoke(&OpArgs { shard, db }, &keys))
            })
            .collect();
        let mut removed = 0;
        for reply in join_slots(slots).await? {
            if let Reply::Integer(n) = reply? {
                removed += n;
            }
        }
        Ok(Reply::Integer(removed))
    }

    /// Runs `commands` in order as one MULTI/EXEC transaction
    ///
    /// Every key is held under an exclusive intent lock until the last
    /// command finishes. The transaction's descriptor is counted on the shard
    /// owning its first key.
    #[instrument(skip(self, commands), fields(commands = commands.len()))]
    pub async fn exec_multi(&self, db: DbIndex, commands: &[Vec<Bytes>]) -> Result<Vec<Reply>> {
        let mut resolved = Vec::with_capacity(commands.len());
        let mut keys = Vec::new();
        for args in commands {
            let name = args
                .first()
                .map(|n| String::from_utf8_lossy(n).to_uppercase())
                .unwrap_or_default();
            let cid = self
                .registry
                .find(&name)
                .ok_or_else(|| Error::CommandNotFound(name.to_lowercase()))?;
            let key = args.get(1).ok_or_else(|| Error::WrongArity(name.to_lowercase()))?;
            keys.push((key.clone(), LockMode::Exclusive));
            resolved.push(cid);
        }
        let Some((first_key, _)) = keys.first().cloned() else {
            return Ok(Vec::new());
        };

        let shard_count = self.shard_set.size();
        let mut touched: Vec<ShardId> = keys.iter().map(|(k, _)| shard_of(k, shard_count)).collect();
        touched.sort_unstable();
        touched.dedup();
        let descriptor = format!(
            "EXEC/{} {}",
            touched.len(),
            resolved
                .iter()
                .zip(commands)
                .map(|(cid, args)| format!("{}:{}", cid.name(), args.len() - 1))
                .collect::<Vec<_>>()
                .join(" ")
        );

        let id = self.schedule(db, &keys, true).await?;
        self.run_scheduled(id, async {
            let mut replies = Vec::with_capacity(commands.len());
            for (cid, args) in resolved.into_iter().zip(commands) {
                let reply = match self.run_resolved(db, cid, &args[1..]).await {
                    Ok(r) => r,
                    Err(e) => e.into(),
                };
                replies.push(reply);
            }

            let owner = shard_of(&first_key, shard_count);
            self.shard_set
                .await_on(owner, move |shard| shard.record_exec(&descriptor))
                .await?;
            Ok(replies)
        })
        .await
    }

    /// Awaits `body`, then concludes transaction `id` whatever the outcome
    async fn run_scheduled<T, F>(&self, id: TxId, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = body.await;
        self.conclude(id).await?;
        outcome
    }

    /// Queues a transaction on every shard owning one of `keys` and takes its
    /// intent locks
    pub async fn schedule(&self, db: DbIndex, keys: &[(Bytes, LockMode)], armed: bool) -> Result<TxId> {
        let id = self.next_txid();
        let mut per_shard: BTreeMap<ShardId, Vec<(Bytes, LockMode)>> = BTreeMap::new();
        for (key, mode) in keys {
            per_shard
                .entry(shard_of(key, self.shard_set.size()))
                .or_default()
                .push((key.clone(), *mode));
        }

        let slots = per_shard
            .into_iter()
            .map(|(sid, keys)| {
                self.shard_set.dispatch(sid, move |shard| {
                    shard.enqueue_tx(TxQueueEntry {
                        id,
                        db,
                        global: false,
                        armed,
                        keys,
                    })
                })
            })
            .collect();
        for res in join_slots(slots).await? {
            res?;
        }
        debug!(txid = id, "Transaction scheduled");
        Ok(id)
    }

    /// Queues a transaction that covers every shard
    pub async fn schedule_global(&self, db: DbIndex, armed: bool) -> Result<TxId> {
        let id = self.next_txid();
        self.shard_set
            .run_brief_in_parallel(move |shard| {
                shard.enqueue_tx(TxQueueEntry {
                    id,
                    db,
                    global: true,
                    armed,
                    keys: Vec::new(),
                })
            })
            .await?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(id)
    }

    /// Removes a transaction from every shard queue and releases its locks
    pub async fn conclude(&self, id: TxId) -> Result<()> {
        self.shard_set
            .run_brief_in_parallel(move |shard| shard.finish_tx(id))
            .await?;
        Ok(())
    }

    /// Parks a blocking transaction (e.g. BLPOP) on `keys`
    ///
    /// A later LPUSH on any of the keys wakes it.
    pub async fn block_on(&self, db: DbIndex, name: &str, keys: &[Bytes]) -> Result<TxId> {
        let id = self.next_txid();
        let mut per_shard: BTreeMap<ShardId, Vec<Bytes>> = BTreeMap::new();
        for key in keys {
            per_shard
                .entry(shard_of(key, self.shard_set.size()))
                .or_default()
                .push(key.clone());
        }

        let slots = per_shard
            .into_iter()
            .map(|(sid, keys)| {
                let tx = WatchingTx::new(id, name);
                self.shard_set.dispatch(sid, move |shard| {
                    let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_ref()).collect();
                    shard.blocking_controller_mut().add_watched(db, &refs, tx);
                })
            })
            .collect();
        join_slots(slots).await?;
        Ok(id)
    }

    /// Drops every key on every shard
    pub async fn flush_all(&self) -> Result<()> {
        self.shard_set
            .run_brief_in_parallel(|shard| shard.db_slice_mut().flush_all())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(shards: usize) -> Result<Service> {
        Service::new(ServerConfig {
            shard_count: shards,
            worker_count: 2,
            dir: std::env::temp_dir().join(format!("shardkv_service_{}", std::process::id())),
            ..Default::default()
        })
    }

    fn cmd(items: &[&str]) -> Vec<Bytes> {
        items
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_execute_routes_by_key() -> Result<()> {
        let svc = service(4)?;
        assert_eq!(svc.execute(0, &cmd(&["SET", "a", "1"])).await, Reply::Ok);
        assert_eq!(svc.execute(0, &cmd(&["set", "b", "2"])).await, Reply::Ok);
        assert_eq!(
            svc.execute(0, &cmd(&["GET", "a"])).await,
            Reply::Bulk(Bytes::from_static(b"1"))
        );
        assert_eq!(svc.execute(0, &cmd(&["DEL", "a", "b", "c"])).await, Reply::Integer(2));
        assert_eq!(svc.execute(0, &cmd(&["GET", "a"])).await, Reply::Nil);
        Ok(())
    }

    #[tokio::test]
    async fn test_errors_become_replies() -> Result<()> {
        let svc = service(2)?;
        let reply = svc.execute(0, &cmd(&["NOPE", "x"])).await;
        assert_eq!(reply.error_message(), Some("unknown command 'nope'"));
        assert!(svc.execute(0, &cmd(&["GET"])).await.is_error());
        assert!(svc.execute(0, &cmd(&["DEBUG"])).await.is_error());
        Ok(())
    }

    #[tokio::test]
    async fn test_exec_multi_records_descriptor() -> Result<()> {
        let svc = service(2)?;
        let replies = svc
            .exec_multi(0, &[cmd(&["SET", "x", "1"]), cmd(&["GET", "x"])])
            .await?;
        assert_eq!(replies, vec![Reply::Ok, Reply::Bulk(Bytes::from_static(b"1"))]);

        let counts = svc
            .shard_set()
            .run_brief_in_parallel(|shard| shard.exec_freq_count())
            .await?;
        let total: u64 = counts.iter().filter_map(|m| m.get("EXEC/1 SET:2 GET:1")).sum();
        assert_eq!(total, 1);

        let tx_total: usize = svc
            .shard_set()
            .run_brief_in_parallel(|shard| shard.analyze_tx_queue().tx_total)
            .await?
            .into_iter()
            .sum();
        assert_eq!(tx_total, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_transaction_releases_locks() -> Result<()> {
        let svc = service(2)?;
        let keys = vec![
            (Bytes::from_static(b"x"), LockMode::Exclusive),
            (Bytes::from_static(b"y"), LockMode::Exclusive),
        ];
        let id = svc.schedule(0, &keys, true).await?;
        let held: usize = svc
            .shard_set()
            .run_brief_in_parallel(|shard| shard.analyze_tx_queue().total_locks)
            .await?
            .into_iter()
            .sum();
        assert_eq!(held, 2);

        let res: Result<()> = svc
            .run_scheduled(id, async { Err(Error::ShardFailed(0)) })
            .await;
        assert!(matches!(res, Err(Error::ShardFailed(0))));

        let infos = svc
            .shard_set()
            .run_brief_in_parallel(|shard| shard.analyze_tx_queue())
            .await?;
        assert!(infos.iter().all(|i| i.tx_total == 0 && i.total_locks == 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_switch_state() -> Result<()> {
        let svc = service(1)?;
        assert_eq!(svc.switch_state(GlobalState::Active, GlobalState::Loading), Ok(()));
        assert_eq!(
            svc.switch_state(GlobalState::Active, GlobalState::Loading),
            Err(GlobalState::Loading)
        );
        assert_eq!(svc.switch_state(GlobalState::Loading, GlobalState::Active), Ok(()));
        assert_eq!(svc.global_state(), GlobalState::Active);
        Ok(())
    }
}
