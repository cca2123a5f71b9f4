//! Backend-neutral transaction interface consumed by the database module.
//!
//! The PostgreSQL implementation lives in the `pglua-db` crate. Calls are
//! synchronous: an execution context runs on a single blocking worker and a
//! database round-trip is the point where it waits.

use std::collections::VecDeque;

/// Errors reported by a transaction backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DbError {
    /// The statement itself failed (syntax, constraint, type error ...).
    #[error("{0}")]
    Statement(String),

    /// The connection or pool could not serve the request.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transaction was already finished.
    #[error("transaction is closed")]
    Closed,
}

/// A positional statement parameter, converted from a script value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// A single column value of a result row.
///
/// Timestamps and UUIDs are already rendered as text by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// The rows produced by a query, in cursor order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: VecDeque<Vec<FieldValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: impl IntoIterator<Item = Vec<FieldValue>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter().collect(),
        }
    }
}

/// One open transaction.
///
/// `rollback` after a successful `commit` must be a no-op returning `Ok`.
pub trait Transaction {
    /// Run a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError>;

    /// Run a statement and return its rows.
    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<RowSet, DbError>;

    fn commit(&mut self) -> Result<(), DbError>;

    fn rollback(&mut self) -> Result<(), DbError>;
}

/// Hands out independent transactions; shared by every request.
pub trait TransactionSource: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction>, DbError>;
}
