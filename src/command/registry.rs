//! Command table

use super::families;
use super::reply::Reply;
use crate::error::{Error, Result};
use crate::shard::EngineShard;
use crate::storage::DbIndex;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler sees of the shard it runs on
pub struct OpArgs<'a> {
    pub shard: &'a EngineShard,
    pub db: DbIndex,
}

/// Runs one command on the shard owning its key; `args` excludes the command name
pub type Handler = fn(&OpArgs<'_>, &[Bytes]) -> Result<Reply>;

/// A registered command
pub struct CommandId {
    name: String,
    /// Redis convention: exact argument count including the name when
    /// positive, a minimum when negative
    arity: i32,
    handler: Handler,
}

impl std::fmt::Debug for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandId")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

impl CommandId {
    pub fn new(name: impl Into<String>, arity: i32, handler: Handler) -> Self {
        Self {
            name: name.into(),
            arity,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> i32 {
        self.arity
    }

    fn check_arity(&self, argc: usize) -> Result<()> {
        let total = argc as i64 + 1;
        let arity = self.arity as i64;
        let ok = if arity >= 0 { total == arity } else { total >= -arity };
        if ok {
            Ok(())
        } else {
            Err(Error::WrongArity(self.name.to_lowercase()))
        }
    }

    /// Validates arity and runs the handler
    pub fn invoke(&self, op: &OpArgs<'_>, args: &[Bytes]) -> Result<Reply> {
        self.check_arity(args.len())?;
        (self.handler)(op, args)
    }
}

/// Name → command lookup, shared by every shard
///
/// Lookups are case-insensitive. Renaming is allowed at any time; callers that
/// resolved a command before the rename keep their `Arc`.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, Arc<CommandId>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in command family
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        families::register_all(&registry);
        registry
    }

    pub fn register(&self, cid: CommandId) {
        self.commands
            .write()
            .insert(cid.name.to_uppercase(), Arc::new(cid));
    }

    pub fn find(&self, name: &str) -> Option<Arc<CommandId>> {
        self.commands.read().get(&name.to_uppercase()).cloned()
    }

    /// Renames `from` to `to`; an empty `to` removes the command
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut commands = self.commands.write();
        let Some(cid) = commands.remove(&from.to_uppercase()) else {
            return Err(Error::CommandNotFound(from.to_string()));
        };
        if to.is_empty() {
            tracing::info!(command = from, "Command removed");
            return Ok(());
        }

        let to = to.to_uppercase();
        if commands.contains_key(&to) {
            commands.insert(from.to_uppercase(), cid);
            return Err(Error::InvalidValue(format!("command '{}' already exists", to)));
        }
        let renamed = CommandId {
            name: to.clone(),
            arity: cid.arity,
            handler: cid.handler,
        };
        commands.insert(to, Arc::new(renamed));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.read().is_empty()
    }
}
