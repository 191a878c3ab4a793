//! In-memory idempotency store on top of [`InMemoryDatabase`].

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use txkit_core::environment::Clock;
use txkit_core::{
    IdempotencyError, IdempotencyRecord, IdempotencyStatus, IdempotencyStore, StoredResponse,
    TxContext, TxHandle, TxStarter,
};

use crate::database::{InMemoryDatabase, InMemoryTx};

const PREFIX: &str = "idempotency:";

fn row_key(key: &str) -> String {
    format!("{PREFIX}{key}")
}

fn encode(record: &IdempotencyRecord) -> Result<Vec<u8>, IdempotencyError> {
    serde_json::to_vec(record).map_err(|e| IdempotencyError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<IdempotencyRecord, IdempotencyError> {
    serde_json::from_slice(bytes).map_err(|e| IdempotencyError::Serialization(e.to_string()))
}

/// Idempotency store keeping records as JSON rows in an [`InMemoryDatabase`].
///
/// `get` locks the row like `SELECT ... FOR UPDATE` would.
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    db: InMemoryDatabase,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    /// Store records in `db`, timestamping with `clock`.
    #[must_use]
    pub fn new(db: InMemoryDatabase, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// The backing database.
    #[must_use]
    pub const fn database(&self) -> &InMemoryDatabase {
        &self.db
    }

    /// Committed record for `key`, read without locking.
    #[must_use]
    pub fn record(&self, key: &str) -> Option<IdempotencyRecord> {
        self.db.get(&row_key(key)).and_then(|bytes| decode(&bytes).ok())
    }

    /// Write a committed record directly, e.g. a stale pending one.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Serialization`] if encoding fails.
    pub fn seed(&self, record: &IdempotencyRecord) -> Result<(), IdempotencyError> {
        self.db.seed(row_key(&record.key), encode(record)?);
        Ok(())
    }

    async fn finish(
        &self,
        ctx: &mut TxContext<InMemoryTx>,
        key: &str,
        status: IdempotencyStatus,
        response: &StoredResponse,
    ) -> Result<(), IdempotencyError> {
        let now = self.clock.now();
        let tx = ctx.tx()?;
        let row = row_key(key);

        let Some(bytes) = tx.get(&row) else {
            tracing::warn!(idempotency_key = key, "Finishing unknown idempotency key");
            return Ok(());
        };
        let mut record = decode(&bytes)?;
        record.status = status;
        record.response = Some(response.clone());
        record.updated_at = Some(now);
        tx.put(row, encode(&record)?);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIdempotencyStore")
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    type Tx = InMemoryTx;

    fn get<'a>(
        &'a self,
        ctx: &'a mut TxContext<InMemoryTx>,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<IdempotencyRecord>, IdempotencyError>> {
        Box::pin(async move {
            let tx = ctx.tx()?;
            let row = row_key(key);
            tx.lock(&row).await;
            tx.get(&row).map(|bytes| decode(&bytes)).transpose()
        })
    }

    fn create<'a>(
        &'a self,
        ctx: &'a mut TxContext<InMemoryTx>,
        key: &'a str,
    ) -> BoxFuture<'a, Result<bool, IdempotencyError>> {
        Box::pin(async move {
            let record = IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::Pending,
                response: None,
                created_at: self.clock.now(),
                updated_at: None,
            };
            let bytes = encode(&record)?;
            Ok(ctx.tx()?.insert_if_absent(&row_key(key), bytes).await)
        })
    }

    fn update<'a>(
        &'a self,
        ctx: &'a mut TxContext<InMemoryTx>,
        key: &'a str,
        response: &'a StoredResponse,
    ) -> BoxFuture<'a, Result<(), IdempotencyError>> {
        Box::pin(self.finish(ctx, key, IdempotencyStatus::Completed, response))
    }

    fn error<'a>(
        &'a self,
        ctx: &'a mut TxContext<InMemoryTx>,
        key: &'a str,
        response: &'a StoredResponse,
    ) -> BoxFuture<'a, Result<(), IdempotencyError>> {
        Box::pin(self.finish(ctx, key, IdempotencyStatus::Error, response))
    }

    fn cleanup(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64, IdempotencyError>> {
        Box::pin(async move {
            let mut tx = self.db.begin().await?;
            let mut deleted = 0;
            for (row, bytes) in tx.scan(PREFIX) {
                let record = decode(&bytes)?;
                let expired = record.status == IdempotencyStatus::Completed
                    && record.updated_at.is_some_and(|at| at < cutoff);
                if expired {
                    tx.delete(row);
                    deleted += 1;
                }
            }
            tx.commit().await?;
            Ok(deleted)
        })
    }
}
