//! Postgres backend for txkit.
//!
//! - [`PgDatabase`] / [`PgTransaction`]: a `PgPool` as transaction starter for
//!   [`TransactionRunner`](txkit_core::TransactionRunner), with `COMMIT AND CHAIN`
//!   and savepoints
//! - [`lock`] / [`try_lock`]: transaction-scoped advisory locks on string names
//! - [`PostgresIdempotencyStore`]: idempotency records locked with `FOR UPDATE`
//! - [`PostgresOutbox`] and [`OutboxRelay`]: the transactional outbox and the
//!   process draining it
//!
//! # Example
//!
//! ```no_run
//! use txkit_core::TransactionRunner;
//! use txkit_postgres::{PgDatabase, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let database = PgDatabase::connect("postgres://localhost/orders").await?;
//! migrate(database.pool()).await?;
//!
//! let runner = TransactionRunner::new(database);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod database;
pub mod idempotency;
pub mod lock;
pub mod outbox;

pub use database::{PgDatabase, PgTransaction, pg_error};
pub use idempotency::PostgresIdempotencyStore;
pub use lock::{lock, lock_key, try_lock};
pub use outbox::{OutboxRelay, OutboxRelayTask, PostgresOutbox};

/// Apply the bundled migrations (`idempotency_requests`, `kafka_outbox`).
///
/// # Errors
///
/// Returns the migration error if a migration fails or was modified after
/// being applied.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
