//! `PgPool` backed transactions.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use txkit_core::{TxError, TxHandle, TxStarter};

/// Map a sqlx error onto [`TxError`]. `RowNotFound` becomes
/// [`TxError::NotFound`] so a missing row does not roll the transaction back.
#[must_use]
pub fn pg_error(err: sqlx::Error) -> TxError {
    match err {
        sqlx::Error::RowNotFound => TxError::NotFound,
        other => TxError::Database(other.to_string()),
    }
}

/// Connection pool that opens [`PgTransaction`]s.
///
/// # Example
///
/// ```no_run
/// use txkit_core::TransactionRunner;
/// use txkit_postgres::PgDatabase;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let database = PgDatabase::connect("postgres://localhost/orders").await?;
/// let runner = TransactionRunner::new(database);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Connect with a small default pool.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Database`] if the connection cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self, TxError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(pg_error)?;
        Ok(Self { pool })
    }

    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl TxStarter for PgDatabase {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, TxError> {
        let inner = self.pool.begin().await.map_err(pg_error)?;
        Ok(PgTransaction { inner })
    }
}

/// An open Postgres transaction.
///
/// Queries run on [`conn`](Self::conn).
pub struct PgTransaction {
    inner: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTransaction").finish_non_exhaustive()
    }
}

impl PgTransaction {
    /// The connection the transaction runs on.
    pub fn conn(&mut self) -> &mut sqlx::PgConnection {
        &mut self.inner
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl TxHandle for PgTransaction {
    async fn commit(self) -> Result<(), TxError> {
        self.inner.commit().await.map_err(pg_error)
    }

    async fn rollback(self) -> Result<(), TxError> {
        self.inner.rollback().await.map_err(pg_error)
    }

    async fn commit_and_chain(&mut self) -> Result<(), TxError> {
        sqlx::query("COMMIT AND CHAIN")
            .execute(self.conn())
            .await
            .map_err(pg_error)?;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), TxError> {
        sqlx::query(&format!("SAVEPOINT {}", quote_ident(name)))
            .execute(self.conn())
            .await
            .map_err(pg_error)?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), TxError> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
            .execute(self.conn())
            .await
            .map_err(pg_error)?;
        Ok(())
    }
}
