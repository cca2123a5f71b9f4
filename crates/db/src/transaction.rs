//! Synchronous transactions over the async `sqlx` pool.
//!
//! Scripts run on blocking worker threads, so each call drives its future to
//! completion on the runtime handle captured when the source was created.
//! These methods must not be called from inside an async task.

use std::fmt;

use futures::TryStreamExt;
use pglua_core::transaction::{DbError, RowSet, SqlParam, Transaction, TransactionSource};
use sqlx::{Column, Executor, Postgres};
use tokio::runtime::Handle;

use crate::convert::{bind_params, db_error, row_values};
use crate::DbPool;

/// Most rows a single query may return. Results are held in memory until
/// the script has iterated them, so this bounds the memory of one query.
pub const MAX_ROWS: usize = 100_000;

/// Hands out one PostgreSQL transaction per `begin`.
#[derive(Clone)]
pub struct PgTransactionSource {
    pool: DbPool,
    handle: Handle,
}

impl PgTransactionSource {
    pub fn new(pool: DbPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Capture the handle of the runtime this is called from.
    ///
    /// Panics when called outside a tokio runtime.
    pub fn from_current(pool: DbPool) -> Self {
        Self::new(pool, Handle::current())
    }
}

impl fmt::Debug for PgTransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgTransactionSource")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl TransactionSource for PgTransactionSource {
    fn begin(&self) -> Result<Box<dyn Transaction>, DbError> {
        let tx = self.handle.block_on(self.pool.begin()).map_err(db_error)?;
        Ok(Box::new(PgTransaction {
            tx: Some(tx),
            handle: self.handle.clone(),
        }))
    }
}

/// An open transaction. `None` once committed or rolled back.
pub struct PgTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    handle: Handle,
}

impl PgTransaction {
    fn open(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, DbError> {
        self.tx.as_mut().ok_or(DbError::Closed)
    }
}

impl Transaction for PgTransaction {
    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError> {
        let handle = self.handle.clone();
        let tx = self.open()?;
        let query = bind_params(sqlx::query(sql), params);
        let result = handle.block_on(query.execute(&mut **tx)).map_err(db_error)?;
        Ok(result.rows_affected())
    }

    fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<RowSet, DbError> {
        let handle = self.handle.clone();
        let tx = self.open()?;
        let query = bind_params(sqlx::query(sql), params);
        let rows = handle.block_on(async {
            let mut stream = query.fetch(&mut **tx);
            let mut rows = Vec::new();
            while let Some(row) = stream.try_next().await.map_err(db_error)? {
                if rows.len() == MAX_ROWS {
                    return Err(DbError::Statement(format!(
                        "query returned more than {MAX_ROWS} rows"
                    )));
                }
                rows.push(row);
            }
            Ok(rows)
        })?;

        let columns = match rows.first() {
            Some(row) => sqlx::Row::columns(row)
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            // Column names of an empty result come from the statement itself.
            None => handle
                .block_on((&mut **tx).describe(sql))
                .map_err(db_error)?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };
        Ok(RowSet::new(columns, rows.iter().map(row_values)))
    }

    fn commit(&mut self) -> Result<(), DbError> {
        let tx = self.tx.take().ok_or(DbError::Closed)?;
        self.handle.block_on(tx.commit()).map_err(db_error)
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        match self.tx.take() {
            Some(tx) => self.handle.block_on(tx.rollback()).map_err(db_error),
            None => Ok(()),
        }
    }
}
