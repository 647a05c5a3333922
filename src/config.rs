//! Server configuration
//!
//! Values are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults ([`ServerConfig::default`])
//! 2. an optional TOML file
//! 3. `SHARDKV_*` environment variables (e.g. `SHARDKV_SHARD_COUNT=8`)
//!
//! The binary applies its command-line flags on top of the result.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SHARDKV";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of shards the keyspace is split into
    pub shard_count: usize,
    /// Number of concurrent populate workers
    pub worker_count: usize,
    /// Snapshot directory
    pub dir: PathBuf,
    /// Snapshot file name inside `dir`
    pub dbfilename: String,
    /// Logical databases per shard
    pub max_databases: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            shard_count: parallelism,
            worker_count: parallelism,
            dir: PathBuf::from("data"),
            dbfilename: "dump.json".to_string(),
            max_databases: 16,
        }
    }
}

impl ServerConfig {
    /// Loads defaults, then `path` if given and present, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("shard_count", defaults.shard_count as u64)
            .and_then(|b| b.set_default("worker_count", defaults.worker_count as u64))
            .and_then(|b| b.set_default("dir", defaults.dir.to_string_lossy().into_owned()))
            .and_then(|b| b.set_default("dbfilename", defaults.dbfilename.clone()))
            .and_then(|b| b.set_default("max_databases", defaults.max_databases as u64))
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        let cfg: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::Config("shard_count must be positive".to_string()));
        }
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be positive".to_string()));
        }
        if self.max_databases == 0 {
            return Err(Error::Config("max_databases must be positive".to_string()));
        }
        if self.max_databases > u16::MAX as usize {
            return Err(Error::Config(format!(
                "max_databases must not exceed {}",
                u16::MAX
            )));
        }
        Ok(())
    }

    /// Default snapshot location, `dir/dbfilename`
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ServerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.snapshot_path(), PathBuf::from("data").join("dump.json"));
    }

    #[test]
    fn test_validation_rejects_zero_counts() {
        let cfg = ServerConfig {
            shard_count: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let cfg = ServerConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("shardkv_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("shardkv.toml");
        std::fs::write(&path, "shard_count = 3\ndbfilename = \"snap.json\"\n")?;

        let cfg = ServerConfig::load(Some(&path))?;
        assert_eq!(cfg.shard_count, 3);
        assert_eq!(cfg.dbfilename, "snap.json");
        assert_eq!(cfg.max_databases, 16);

        std::fs::remove_dir_all(&dir).ok();
        Ok(())
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() -> Result<()> {
        let path = std::env::temp_dir().join("shardkv_does_not_exist.toml");
        let cfg = ServerConfig::load(Some(&path))?;
        assert_eq!(cfg.dbfilename, "dump.json");
        Ok(())
    }

    #[test]
    fn test_toml_round_trip() -> Result<()> {
        let cfg = ServerConfig::default();
        let text = cfg.to_toml()?;
        let parsed: ServerConfig =
            toml::from_str(&text).map_err(|e| Error::Serialization(e.to_string()))?;
        assert_eq!(parsed, cfg);
        Ok(())
    }
}
