// ShardKV - Rust Implementation
// Sharded in-memory key-value store: fan-out execution and diagnostics core

#![warn(rust_2018_idioms)]

pub mod command;
pub mod config;
pub mod debug;
pub mod metrics;
pub mod persistence;
pub mod server;
pub mod shard;
pub mod storage;

mod logging;

// Re-exports for convenience
pub use config::ServerConfig;
pub use debug::DebugCmd;
pub use server::Service;
pub use shard::{ShardId, ShardSet};

/// ShardKV error types
pub mod error {
    use crate::shard::ShardId;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("no such key")]
        KeyNotFound,

        #[error("Operation against a key holding the wrong kind of value")]
        WrongType,

        #[error("value is not an integer or out of range")]
        InvalidInt,

        #[error("syntax error")]
        Syntax,

        #[error("Invalid value: {0}")]
        InvalidValue(String),

        #[error("Unknown subcommand or wrong number of arguments for '{0}'. Try {1} HELP.")]
        UnknownSubcommand(String, &'static str),

        #[error("unknown command '{0}'")]
        CommandNotFound(String),

        #[error("wrong number of arguments for '{0}' command")]
        WrongArity(String),

        #[error("Persistence error: {0}")]
        Persistence(String),

        #[error("{0} in progress, ignored")]
        Loading(&'static str),

        #[error("Shard {0} failed to complete its task")]
        ShardFailed(ShardId),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
