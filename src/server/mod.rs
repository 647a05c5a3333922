//! ShardKV service layer
//!
//! [`Service`] owns the shard set, the command table and the persistence
//! backend, and routes each command to the shard that owns its key. There is
//! no network front end here; callers hand in already-parsed argument lists.

mod service;

pub use service::Service;

/// Server-wide lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalState {
    Active,
    Loading,
    ShuttingDown,
}

impl GlobalState {
    pub fn name(&self) -> &'static str {
        match self {
            GlobalState::Active => "ACTIVE",
            GlobalState::Loading => "LOADING",
            GlobalState::ShuttingDown => "SHUTTING DOWN",
        }
    }
}

impl std::fmt::Display for GlobalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
