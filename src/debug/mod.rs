//! `DEBUG` sub-commands
//!
//! Introspection and bulk-loading tools that fan out over every shard:
//!
//! ```text
//! DEBUG POPULATE  ─→ WorkDistributor  ─→ batches per shard ─→ StubTransaction
//! DEBUG OBJHIST   ─→ blocking fan-out  ─→ ObjHistMap per shard ─→ merge
//! DEBUG SHARDS/TX ─→ brief fan-out     ─→ per-shard stats ─→ min/max, text
//! DEBUG OBJECT    ─→ owning shard only
//! ```

pub mod aggregate;
pub mod histogram;
pub mod inspect;
pub mod objhist;
pub mod populate;

use crate::command::Reply;
use crate::error::{Error, Result};
use crate::server::{GlobalState, Service};
use crate::shard::shard_of;
use crate::storage::DbIndex;
use aggregate::{FrequencyMerge, ShardInfo, WatchedInfo};
use bytes::Bytes;
use objhist::ObjHistMap;
use populate::PopulateOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const HELP_LINES: &[&str] = &[
    "DEBUG <subcommand> [<arg> [value] [opt] ...]. Subcommands are:",
    "OBJECT <key> [COMPRESS]",
    "    Show low-level info about `key` and associated value.",
    "    If COMPRESS is given, estimates the compression ratio of the value.",
    "LOAD <filename>",
    "    Flush the dataset and load it from the given snapshot file.",
    "RELOAD [option ...]",
    "    Save the dataset snapshot on disk and reload it back to memory. Valid <option> values:",
    "    * NOSAVE: the database will be loaded from an existing snapshot file.",
    "    Examples:",
    "    * DEBUG RELOAD NOSAVE: replace the current database with the contents of",
    "      an existing snapshot file.",
    "WATCHED",
    "    Shows the watched keys as a result of BLPOP and similar operations.",
    "POPULATE <count> [prefix] [size] [RAND] [SLOTS start end] [TYPE type] [ELEMENTS elements]",
    "    Create <count> string keys named key:<num>.",
    "    If <prefix> is specified then it is used instead of the 'key' prefix.",
    "    If RAND is specified then value will be set to random hex string in specified size.",
    "    If SLOTS is specified then create keys only in given slots range.",
    "    TYPE specifies data type (must be STRING/LIST/SET/HASH/ZSET/JSON), default STRING.",
    "    ELEMENTS specifies how many sub elements if relevant (like entries in a list / set).",
    "OBJHIST",
    "    Prints histogram of object sizes.",
    "SHARDS",
    "    Prints memory and key statistics per shard, with min/max across shards.",
    "TX",
    "    Performs transaction analysis per shard.",
    "EXEC",
    "    Show the descriptors of the MULTI/EXEC transactions that were executed.",
    "HELP",
    "    Prints this help.",
];

/// Restores ACTIVE when a load finishes, however it finishes
struct LoadingGuard<'a>(&'a Service);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.switch_state(GlobalState::Loading, GlobalState::Active);
    }
}

/// `DEBUG` invocation bound to a service and the caller's database
pub struct DebugCmd<'a> {
    service: &'a Service,
    db: DbIndex,
}

impl<'a> DebugCmd<'a> {
    pub fn new(service: &'a Service, db: DbIndex) -> Self {
        Self { service, db }
    }

    /// Runs `args`; `args[0]` is the sub-command name
    pub async fn run(&self, args: &[Bytes]) -> Reply {
        let Some(subcmd) = args.first() else {
            return Error::WrongArity("debug".to_string()).into();
        };
        let subcmd = String::from_utf8_lossy(subcmd).to_uppercase();

        let res = match subcmd.as_str() {
            "HELP" => Ok(Reply::StringArray(
                HELP_LINES.iter().map(|l| l.to_string()).collect(),
            )),
            "POPULATE" => self.populate(&args[1..]).await,
            "OBJECT" if args.len() >= 2 => self.inspect(&args[1], &args[2..]).await,
            "OBJHIST" => self.obj_hist().await,
            "SHARDS" => self.shards().await,
            "TX" => self.tx_analysis().await,
            "WATCHED" => self.watched().await,
            "EXEC" => self.exec().await,
            "RELOAD" => self.reload(&args[1..]).await,
            "LOAD" if args.len() == 2 => {
                let filename = String::from_utf8_lossy(&args[1]).into_owned();
                self.load(&filename).await
            }
            _ => Err(Error::UnknownSubcommand(subcmd.clone(), "DEBUG")),
        };
        res.into()
    }

    async fn populate(&self, args: &[Bytes]) -> Result<Reply> {
        let options = PopulateOptions::parse(args)?;
        let total = options.total_count;
        populate::populate(
            Arc::clone(self.service.shard_set()),
            Arc::clone(self.service.registry()),
            options,
            self.db,
            self.service.config().worker_count,
        )
        .await?;
        info!(keys = total, db = self.db, "Population finished");
        Ok(Reply::Ok)
    }

    async fn inspect(&self, key: &Bytes, rest: &[Bytes]) -> Result<Reply> {
        let check_compression = rest.len() == 1 && rest[0].eq_ignore_ascii_case(b"COMPRESS");
        let shard_set = self.service.shard_set();
        let sid = shard_of(key, shard_set.size());
        let db = self.db;
        let key = key.clone();

        if check_compression {
            let est = shard_set
                .await_on(sid, move |shard| inspect::estimate_compression(shard, db, &key))
                .await??;
            return Ok(Reply::SimpleString(inspect::format_compression(&est)));
        }

        let info = shard_set
            .await_on(sid, move |shard| inspect::inspect_op(shard, db, &key))
            .await?;
        if !info.found {
            return Err(Error::KeyNotFound);
        }
        Ok(Reply::SimpleString(inspect::format_object_info(&info, sid)))
    }

    async fn obj_hist(&self) -> Result<Reply> {
        let per_shard = self
            .service
            .shard_set()
            .run_blocking_in_parallel(objhist::build_obj_hist)
            .await?;
        let mut merged = ObjHistMap::new();
        for map in per_shard {
            objhist::merge_obj_hist_map(map, &mut merged);
        }
        Ok(Reply::Verbatim(objhist::render(&merged)))
    }

    async fn shards(&self) -> Result<Reply> {
        let infos = self
            .service
            .shard_set()
            .run_brief_in_parallel(ShardInfo::collect)
            .await?;
        Ok(Reply::Verbatim(aggregate::render_shards(&infos)))
    }

    async fn tx_analysis(&self) -> Result<Reply> {
        let infos = self
            .service
            .shard_set()
            .run_brief_in_parallel(|shard| shard.analyze_tx_queue())
            .await?;
        Ok(Reply::Verbatim(aggregate::render_tx(&infos)))
    }

    async fn watched(&self) -> Result<Reply> {
        let db = self.db;
        let parts = self
            .service
            .shard_set()
            .run_brief_in_parallel(move |shard| WatchedInfo::collect(shard, db))
            .await?;
        let info = WatchedInfo::union(parts);
        Ok(Reply::Array(vec![
            Reply::Bulk(Bytes::from_static(b"awaked")),
            Reply::StringArray(info.awakened),
            Reply::Bulk(Bytes::from_static(b"watched")),
            Reply::StringArray(info.watched),
        ]))
    }

    async fn exec(&self) -> Result<Reply> {
        let freq = Arc::new(FrequencyMerge::new());
        let sink = Arc::clone(&freq);
        self.service
            .shard_set()
            .run_brief_in_parallel(move |shard| sink.add(shard.exec_freq_count()))
            .await?;
        Ok(Reply::Verbatim(freq.render()))
    }

    async fn reload(&self, opts: &[Bytes]) -> Result<Reply> {
        let mut save = true;
        for opt in opts {
            if opt.eq_ignore_ascii_case(b"NOSAVE") {
                save = false;
            } else {
                return Ok(Reply::Error(
                    "DEBUG RELOAD only supports the NOSAVE options.".to_string(),
                ));
            }
        }

        let persistence = self.service.persistence();
        if save {
            persistence.save(self.service.shard_set()).await?;
        }
        let path = persistence
            .last_save_file()
            .unwrap_or_else(|| persistence.default_path());
        self.load_path(path).await
    }

    async fn load(&self, filename: &str) -> Result<Reply> {
        let path = if filename.is_empty() {
            self.service.persistence().default_path()
        } else {
            PathBuf::from(filename)
        };
        self.load_path(path).await
    }

    async fn load_path(&self, path: PathBuf) -> Result<Reply> {
        if let Err(state) = self
            .service
            .switch_state(GlobalState::Active, GlobalState::Loading)
        {
            warn!("{} in progress, ignored", state);
            return Err(Error::Loading(state.name()));
        }
        let _guard = LoadingGuard(self.service);

        self.service.flush_all().await?;
        match self
            .service
            .persistence()
            .load(self.service.shard_set(), &path)
            .await
        {
            Ok(keys) => {
                info!(path = %path.display(), keys, "Dataset loaded");
                Ok(Reply::Ok)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not load file");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn service(name: &str, shards: usize) -> Result<Service> {
        Service::new(ServerConfig {
            shard_count: shards,
            worker_count: 2,
            dir: std::env::temp_dir().join(format!("shardkv_debug_{}_{}", name, std::process::id())),
            ..Default::default()
        })
    }

    fn args(items: &[&str]) -> Vec<Bytes> {
        items
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_subcommand() -> Result<()> {
        let svc = service("unknown", 1)?;
        let reply = DebugCmd::new(&svc, 0).run(&args(&["frob"])).await;
        assert_eq!(
            reply.error_message(),
            Some("Unknown subcommand or wrong number of arguments for 'FROB'. Try DEBUG HELP.")
        );

        // LOAD takes exactly one file name
        let reply = DebugCmd::new(&svc, 0).run(&args(&["LOAD"])).await;
        assert!(reply.is_error());
        let reply = DebugCmd::new(&svc, 0).run(&args(&["OBJECT"])).await;
        assert!(reply.is_error());
        Ok(())
    }

    #[tokio::test]
    async fn test_help_lists_subcommands() -> Result<()> {
        let svc = service("help", 1)?;
        let Reply::StringArray(lines) = DebugCmd::new(&svc, 0).run(&args(&["help"])).await else {
            panic!("expected a string array");
        };
        for name in ["POPULATE", "OBJECT", "OBJHIST", "SHARDS", "RELOAD", "WATCHED"] {
            assert!(lines.iter().any(|l| l.starts_with(name)), "{} missing", name);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_object_not_found() -> Result<()> {
        let svc = service("object", 2)?;
        let reply = DebugCmd::new(&svc, 0).run(&args(&["OBJECT", "nope"])).await;
        assert_eq!(reply.error_message(), Some("no such key"));
        Ok(())
    }

    #[tokio::test]
    async fn test_reload_rejects_unknown_option() -> Result<()> {
        let svc = service("reload_opt", 1)?;
        let reply = DebugCmd::new(&svc, 0).run(&args(&["RELOAD", "FAST"])).await;
        assert_eq!(
            reply.error_message(),
            Some("DEBUG RELOAD only supports the NOSAVE options.")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_load_refused_while_loading() -> Result<()> {
        let svc = service("refused", 1)?;
        assert!(svc.switch_state(GlobalState::Active, GlobalState::Loading).is_ok());
        let reply = DebugCmd::new(&svc, 0).run(&args(&["LOAD", "x.json"])).await;
        assert_eq!(reply.error_message(), Some("LOADING in progress, ignored"));
        // a refused load leaves the state alone
        assert_eq!(svc.global_state(), GlobalState::Loading);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_load_restores_active() -> Result<()> {
        let svc = service("failed_load", 1)?;
        let missing = std::env::temp_dir().join(format!("shardkv_missing_{}.json", std::process::id()));
        let reply = DebugCmd::new(&svc, 0)
            .run(&[Bytes::from_static(b"LOAD"), Bytes::from(missing.display().to_string())])
            .await;
        assert!(reply.is_error());
        assert_eq!(svc.global_state(), GlobalState::Active);
        Ok(())
    }
}
