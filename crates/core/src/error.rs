//! Error types shared across the runtime core.
//!
//! Statement-level database failures are not errors at this level: they are
//! handed back to the script as values. Everything here either aborts an
//! execution context or is a host-side programming mistake.

use crate::transaction::DbError;

/// Failure of one script execution, reported by [`ExecutionContext::run`].
///
/// Variants are `Clone` so they can travel through the interpreter as an
/// external error value and be recovered intact at the top of the context.
///
/// [`ExecutionContext::run`]: crate::context::ExecutionContext::run
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to read script {path}: {message}")]
    Io { path: String, message: String },

    #[error("syntax error: {0}")]
    Compile(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("recursive loading of module {0} is not allowed")]
    RecursiveLoad(String),

    #[error("failed to construct module {module}: {reason}")]
    ModuleConstruction { module: String, reason: String },

    #[error("database savepoint failure: {0}")]
    Savepoint(String),

    #[error("no module loader attached to {0}")]
    NoLoader(String),

    #[error("module loader for {0} is no longer available")]
    LoaderGone(String),
}

/// Misuse of the typed state store. These are host programming errors and
/// abort module construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("state not found: {0}")]
    NotFound(String),

    #[error("type mismatch when getting state {name}: stored {stored}, requested {requested}")]
    TypeMismatch {
        name: String,
        stored: &'static str,
        requested: &'static str,
    },

    #[error("state {0} is owned by a parent loader and cannot be replaced")]
    NotOwner(String),
}

/// Failure raised by a capability module's constructor or destroy hook.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("{context}: failed to start transaction: {source}")]
    Begin { context: String, source: DbError },

    #[error("{context}: unable to commit transaction: {source}")]
    Commit { context: String, source: DbError },

    #[error("{context}: transaction was aborted after a savepoint failure")]
    Aborted { context: String },

    #[error("{0}")]
    Other(String),
}
