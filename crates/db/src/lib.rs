//! PostgreSQL backend for the script runtime.
//!
//! Provides pool construction and a [`TransactionSource`] implementation on
//! top of `sqlx`, so the runtime core stays free of any database driver.
//!
//! [`TransactionSource`]: pglua_core::transaction::TransactionSource

use sqlx::postgres::PgPoolOptions;

pub mod convert;
pub mod transaction;

pub use transaction::PgTransactionSource;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Verify the pool can reach the server.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
