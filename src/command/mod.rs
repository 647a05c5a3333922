//! Command registry, handlers and execution contexts

pub mod families;
pub mod registry;
pub mod reply;
pub mod transaction;

pub use registry::{CommandId, CommandRegistry, Handler, OpArgs};
pub use reply::Reply;
pub use transaction::StubTransaction;
