//! Script execution runtime: execution contexts, the module loader, the
//! capability-module protocol and the built-in capability modules.
//!
//! The crate has no database driver and no HTTP framework. Both are reached
//! through the [`transaction`] and [`http`] abstractions, whose concrete
//! values are injected through the [`state`] store.

pub mod context;
pub mod engine;
pub mod error;
pub mod http;
pub mod loader;
pub mod module;
pub mod modules;
pub mod state;
pub mod transaction;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{ExecutionContext, PrintSink, RunOutcome};
pub use engine::EarlyExit;
pub use error::{ModuleError, ScriptError, StateError};
pub use loader::ModuleLoader;
pub use module::{CapabilityModule, ModuleRegistry};
pub use mlua;
