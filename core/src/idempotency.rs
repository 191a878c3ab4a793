//! Idempotency records and the decision logic around them.
//!
//! Each key moves through `Pending -> {Completed, Error}`. The store reads
//! records with a row lock, so two requests carrying the same key serialize
//! on that lock inside their transactions.
//!
//! | stored record                  | [`Verdict`]                 |
//! |--------------------------------|-----------------------------|
//! | none                           | `Execute { retry: false }`  |
//! | `Completed`                    | `Replay(response)`          |
//! | `Error`                        | `Execute { retry: true }`   |
//! | `Pending`, younger than limit  | `RetryLater`                |
//! | `Pending`, at or past limit    | `Stuck { age }`             |

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::environment::Clock;
use crate::transaction::{TxContext, TxError, TxHandle};

/// Header carrying the idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Errors from idempotency stores.
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// The database rejected a statement
    #[error("Database error: {0}")]
    Database(String),

    /// Stored data could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stored status is not one of the known values
    #[error("Invalid idempotency status: {0}")]
    InvalidStatus(String),

    /// The record vanished between insert and read
    #[error("Idempotency record for key '{0}' disappeared")]
    Vanished(String),

    /// Transaction failure
    #[error(transparent)]
    Transaction(#[from] TxError),
}

impl From<IdempotencyError> for TxError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::Transaction(err) => err,
            other => Self::app(other),
        }
    }
}

/// Processing state of an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    /// The owning request is still running
    Pending,
    /// Finished successfully, response stored
    Completed,
    /// Finished with an error. The key may be retried
    Error,
}

impl IdempotencyStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidStatus`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, IdempotencyError> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(IdempotencyError::InvalidStatus(other.to_string())),
        }
    }
}

/// A captured HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code
    pub status_code: u16,
    /// Headers as produced by [`encode_headers`]
    pub headers: Vec<u8>,
    /// Raw body
    pub body: Vec<u8>,
}

/// A persisted idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Client supplied key
    pub key: String,
    /// Current state
    pub status: IdempotencyStatus,
    /// Captured response, once finished
    pub response: Option<StoredResponse>,
    /// When the key was first seen
    pub created_at: DateTime<Utc>,
    /// Last transition
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persistence for idempotency records.
///
/// Every operation except [`cleanup`](Self::cleanup) runs inside the caller's
/// transaction.
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Transaction type the store works with.
    type Tx: TxHandle;

    /// Read the record for `key`, locking it until the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the query fails. A missing key is `Ok(None)`.
    fn get<'a>(
        &'a self,
        ctx: &'a mut TxContext<Self::Tx>,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<IdempotencyRecord>, IdempotencyError>>;

    /// Insert a `Pending` record. Returns `false` if the key already exists.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the insert fails.
    fn create<'a>(
        &'a self,
        ctx: &'a mut TxContext<Self::Tx>,
        key: &'a str,
    ) -> BoxFuture<'a, Result<bool, IdempotencyError>>;

    /// Mark `key` completed and store the response.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the update fails.
    fn update<'a>(
        &'a self,
        ctx: &'a mut TxContext<Self::Tx>,
        key: &'a str,
        response: &'a StoredResponse,
    ) -> BoxFuture<'a, Result<(), IdempotencyError>>;

    /// Mark `key` failed and store the response.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the update fails.
    fn error<'a>(
        &'a self,
        ctx: &'a mut TxContext<Self::Tx>,
        key: &'a str,
        response: &'a StoredResponse,
    ) -> BoxFuture<'a, Result<(), IdempotencyError>>;

    /// Delete completed records last updated before `cutoff`, in a transaction
    /// of its own. Returns the number of deleted records.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the delete fails.
    fn cleanup(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64, IdempotencyError>>;
}

/// Tuning for idempotency handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Age after which a pending record counts as stuck
    pub stale_after: Duration,
    /// How long completed records are kept
    pub retention: Duration,
    /// How often cleanup runs
    pub cleanup_interval: Duration,
    /// Largest response body that is captured
    pub max_body_bytes: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(2 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

impl IdempotencyConfig {
    /// Set the stuck threshold.
    #[must_use]
    pub const fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Set the retention of completed records.
    #[must_use]
    pub const fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the cleanup interval.
    #[must_use]
    pub const fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the response body limit.
    #[must_use]
    pub const fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

/// What to do with a request given the stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Return the stored response without running the handler
    Replay(StoredResponse),
    /// Run the handler. `retry` is set when a previous attempt failed
    Execute {
        /// A previous attempt ended in `Error`
        retry: bool,
    },
    /// Another request holds the key. The client should retry later
    RetryLater,
    /// The key has been pending for too long
    Stuck {
        /// Time since the key was created
        age: Duration,
    },
}

/// Decide what to do with `record` at time `now`.
#[must_use]
pub fn classify(record: &IdempotencyRecord, now: DateTime<Utc>, stale_after: Duration) -> Verdict {
    match (record.status, &record.response) {
        (IdempotencyStatus::Completed, Some(response)) => Verdict::Replay(response.clone()),
        (IdempotencyStatus::Completed, None) => {
            tracing::warn!(
                idempotency_key = %record.key,
                "Completed idempotency record has no response, running handler again"
            );
            Verdict::Execute { retry: true }
        }
        (IdempotencyStatus::Error, _) => Verdict::Execute { retry: true },
        (IdempotencyStatus::Pending, _) => {
            let age = (now - record.created_at).to_std().unwrap_or_default();
            if age >= stale_after {
                Verdict::Stuck { age }
            } else {
                Verdict::RetryLater
            }
        }
    }
}

/// Lock or create the record for `key` and decide what to do.
///
/// If a concurrent request inserted the key between the locked read and the
/// insert, the record is read again (waiting for its lock) and classified.
///
/// # Errors
///
/// Returns [`IdempotencyError`] if the store fails.
pub async fn acquire<S: IdempotencyStore>(
    store: &S,
    ctx: &mut TxContext<S::Tx>,
    key: &str,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<Verdict, IdempotencyError> {
    if let Some(record) = store.get(ctx, key).await? {
        return Ok(classify(&record, now, stale_after));
    }

    if store.create(ctx, key).await? {
        return Ok(Verdict::Execute { retry: false });
    }

    tracing::debug!(idempotency_key = key, "Lost insert race, reading record again");
    let record = store
        .get(ctx, key)
        .await?
        .ok_or_else(|| IdempotencyError::Vanished(key.to_string()))?;
    Ok(classify(&record, now, stale_after))
}

/// Persist the final outcome of a request.
///
/// # Errors
///
/// Returns [`IdempotencyError`] if the store fails.
pub async fn record_outcome<S: IdempotencyStore>(
    store: &S,
    ctx: &mut TxContext<S::Tx>,
    key: &str,
    response: &StoredResponse,
) -> Result<(), IdempotencyError> {
    if response.status_code >= 400 {
        store.error(ctx, key, response).await
    } else {
        store.update(ctx, key, response).await
    }
}

/// Serialize header pairs as a JSON map of name to values.
///
/// # Errors
///
/// Returns [`IdempotencyError::Serialization`] if serialization fails.
pub fn encode_headers<'h>(
    headers: impl IntoIterator<Item = (&'h str, &'h str)>,
) -> Result<Vec<u8>, IdempotencyError> {
    let mut map: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name).or_default().push(value);
    }
    serde_json::to_vec(&map).map_err(|e| IdempotencyError::Serialization(e.to_string()))
}

/// Inverse of [`encode_headers`]. Empty input means no headers.
///
/// # Errors
///
/// Returns [`IdempotencyError::Serialization`] if the bytes are not a header map.
pub fn decode_headers(bytes: &[u8]) -> Result<BTreeMap<String, Vec<String>>, IdempotencyError> {
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_slice(bytes).map_err(|e| IdempotencyError::Serialization(e.to_string()))
}

/// Delete completed records older than `retention` once.
///
/// # Errors
///
/// Returns [`IdempotencyError`] if the store fails.
pub async fn run_cleanup<S: IdempotencyStore + ?Sized>(
    store: &S,
    clock: &dyn Clock,
    retention: Duration,
) -> Result<u64, IdempotencyError> {
    let retention = chrono::Duration::from_std(retention)
        .map_err(|e| IdempotencyError::Serialization(e.to_string()))?;
    let cutoff = clock.now() - retention;

    tracing::info!(cutoff = %cutoff, "Cleaning up completed idempotency records");
    let deleted = store.cleanup(cutoff).await?;
    metrics::counter!("idempotency.cleanup.deleted").increment(deleted);
    tracing::info!(deleted, "Idempotency cleanup finished");
    Ok(deleted)
}

/// Background task running [`run_cleanup`] periodically.
#[derive(Debug)]
pub struct CleanupTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Start cleaning up every `config.cleanup_interval`. The first run happens
    /// one interval after start.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn<S: IdempotencyStore>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        config: &IdempotencyConfig,
    ) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let interval = config.cleanup_interval;
        let retention = config.retention;

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Err(err) = run_cleanup(&*store, &*clock, retention).await {
                            tracing::error!(error = %err, "Failed to clean up old idempotency records");
                        }
                    }
                }
            }
            tracing::debug!("Idempotency cleanup stopped");
        });

        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Stop the task and wait for a running cleanup to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Idempotency cleanup task failed");
            }
        }
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
