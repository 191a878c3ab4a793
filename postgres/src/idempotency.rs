//! Postgres-backed idempotency records.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::{PgPool, Row};
use txkit_core::{
    IdempotencyError, IdempotencyRecord, IdempotencyStatus, IdempotencyStore, StoredResponse,
    TxContext,
};

use crate::database::PgTransaction;

const SCHEMA: &str = include_str!("../migrations/0001_idempotency.sql");

fn db_error(err: sqlx::Error) -> IdempotencyError {
    IdempotencyError::Database(err.to_string())
}

/// Idempotency records in the `idempotency_requests` table.
///
/// Record operations run in the caller's transaction. `get` uses
/// `SELECT ... FOR UPDATE`, so concurrent requests with the same key queue up
/// behind the first one until it commits.
///
/// # Example
///
/// ```no_run
/// use txkit_postgres::PostgresIdempotencyStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresIdempotencyStore::new(pool);
/// store.ensure_schema().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Create a store using `pool` for cleanup and schema setup.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Database`] if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), IdempotencyError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<IdempotencyRecord, IdempotencyError> {
        let status: String = row.try_get("status").map_err(db_error)?;
        let code: Option<i32> = row.try_get("response_code").map_err(db_error)?;

        let response = match code {
            Some(code) => Some(StoredResponse {
                status_code: u16::try_from(code).map_err(|_| {
                    IdempotencyError::Serialization(format!("invalid status code {code}"))
                })?,
                headers: row
                    .try_get::<Option<Vec<u8>>, _>("response_headers")
                    .map_err(db_error)?
                    .unwrap_or_default(),
                body: row
                    .try_get::<Option<Vec<u8>>, _>("response_body")
                    .map_err(db_error)?
                    .unwrap_or_default(),
            }),
            None => None,
        };

        Ok(IdempotencyRecord {
            key: row.try_get("idempotency_key").map_err(db_error)?,
            status: IdempotencyStatus::parse(&status)?,
            response,
            created_at: row.try_get("created_at").map_err(db_error)?,
            updated_at: row.try_get("updated_at").map_err(db_error)?,
        })
    }

    async fn finish(
        ctx: &mut TxContext<PgTransaction>,
        key: &str,
        status: IdempotencyStatus,
        response: &StoredResponse,
    ) -> Result<(), IdempotencyError> {
        let result = sqlx::query(
            r"
            UPDATE idempotency_requests
            SET status = $2,
                response_code = $3,
                response_headers = $4,
                response_body = $5,
                updated_at = NOW()
            WHERE idempotency_key = $1
            ",
        )
        .bind(key)
        .bind(status.as_str())
        .bind(i32::from(response.status_code))
        .bind(&response.headers)
        .bind(&response.body)
        .execute(ctx.tx()?.conn())
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            tracing::warn!(idempotency_key = key, "Finishing unknown idempotency key");
        }
        Ok(())
    }
}

impl IdempotencyStore for PostgresIdempotencyStore {
    type Tx = PgTransaction;

    fn get<'a>(
        &'a self,
        ctx: &'a mut TxContext<PgTransaction>,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<IdempotencyRecord>, IdempotencyError>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT idempotency_key, status, response_code, response_headers,
                       response_body, created_at, updated_at
                FROM idempotency_requests
                WHERE idempotency_key = $1
                FOR UPDATE
                ",
            )
            .bind(key)
            .fetch_optional(ctx.tx()?.conn())
            .await
            .map_err(db_error)?;

            row.as_ref().map(Self::row_to_record).transpose()
        })
    }

    fn create<'a>(
        &'a self,
        ctx: &'a mut TxContext<PgTransaction>,
        key: &'a str,
    ) -> BoxFuture<'a, Result<bool, IdempotencyError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO idempotency_requests (idempotency_key, status)
                VALUES ($1, 'pending')
                ON CONFLICT (idempotency_key) DO NOTHING
                ",
            )
            .bind(key)
            .execute(ctx.tx()?.conn())
            .await
            .map_err(db_error)?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn update<'a>(
        &'a self,
        ctx: &'a mut TxContext<PgTransaction>,
        key: &'a str,
        response: &'a StoredResponse,
    ) -> BoxFuture<'a, Result<(), IdempotencyError>> {
        Box::pin(Self::finish(ctx, key, IdempotencyStatus::Completed, response))
    }

    fn error<'a>(
        &'a self,
        ctx: &'a mut TxContext<PgTransaction>,
        key: &'a str,
        response: &'a StoredResponse,
    ) -> BoxFuture<'a, Result<(), IdempotencyError>> {
        Box::pin(Self::finish(ctx, key, IdempotencyStatus::Error, response))
    }

    fn cleanup(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64, IdempotencyError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                DELETE FROM idempotency_requests
                WHERE status = 'completed' AND updated_at < $1
                ",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

            Ok(result.rows_affected())
        })
    }
}
