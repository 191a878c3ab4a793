//! Transactional outbox: events written in the business transaction, published
//! later by [`OutboxRelay`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use sqlx::{PgPool, Row};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use txkit_core::{
    Encoder, Envelope, EventHeaders, EventTopics, OutboundMessage, Publisher, SenderError,
    TransactionalSender, TxContext,
};

use crate::database::PgTransaction;

const SCHEMA: &str = include_str!("../migrations/0002_kafka_outbox.sql");

fn db_error(err: sqlx::Error) -> SenderError {
    SenderError::Database(err.to_string())
}

/// Writes encoded events into `kafka_outbox` inside the caller's transaction.
///
/// Rows become visible, and relayable, only when the transaction commits.
pub struct PostgresOutbox {
    encoder: Arc<dyn Encoder>,
    topics: EventTopics,
}

impl PostgresOutbox {
    /// Encode with `encoder` and route with `topics`.
    #[must_use]
    pub fn new(encoder: Arc<dyn Encoder>, topics: EventTopics) -> Self {
        Self { encoder, topics }
    }

    /// Create the outbox table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Database`] if the DDL fails.
    pub async fn ensure_schema(pool: &PgPool) -> Result<(), SenderError> {
        sqlx::raw_sql(SCHEMA).execute(pool).await.map_err(db_error)?;
        Ok(())
    }
}

impl std::fmt::Debug for PostgresOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresOutbox")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl TransactionalSender<PgTransaction> for PostgresOutbox {
    fn send_in_tx<'a>(
        &'a self,
        ctx: &'a mut TxContext<PgTransaction>,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>> {
        Box::pin(async move {
            let topic = self.topics.topic_for(&*envelope.event).name.clone();
            let payload = self.encoder.encode(&*envelope.event).await?;
            let headers = if envelope.headers.is_empty() {
                None
            } else {
                Some(
                    serde_json::to_value(&envelope.headers)
                        .map_err(|e| SenderError::Database(e.to_string()))?,
                )
            };

            sqlx::query(
                r"
                INSERT INTO kafka_outbox (topic, key, headers, schema, payload)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(&topic)
            .bind(&envelope.key)
            .bind(headers)
            .bind(envelope.event.schema())
            .bind(payload)
            .execute(ctx.tx()?.conn())
            .await
            .map_err(db_error)?;

            tracing::debug!(topic = %topic, event_type = envelope.event_type(), "Event written to outbox");
            Ok(())
        })
    }
}

/// Moves committed outbox rows to the broker, oldest first.
///
/// Rows are claimed with `FOR UPDATE SKIP LOCKED`, so several relays can run
/// against the same table. A row is deleted only after it was published; a
/// publish failure stops the batch so later rows do not overtake it.
pub struct OutboxRelay {
    pool: PgPool,
    publisher: Arc<dyn Publisher>,
    batch_size: i64,
    poll_interval: Duration,
}

impl OutboxRelay {
    /// Relay from `pool` to `publisher`, 100 rows per batch, polling every second.
    #[must_use]
    pub fn new(pool: PgPool, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            pool,
            publisher,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Rows claimed per batch.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Pause between batches when the outbox is empty.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Publish and delete one batch. Returns the number of relayed rows.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Database`] if claiming or deleting fails, or the
    /// publish error if nothing could be relayed.
    pub async fn relay_batch(&self) -> Result<usize, SenderError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let rows = sqlx::query(
            r"
            SELECT id, topic, key, headers, payload
            FROM kafka_outbox
            ORDER BY id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(self.batch_size)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        let mut relayed = Vec::with_capacity(rows.len());
        let mut failure = None;
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(db_error)?;
            let message = Self::row_to_message(row)?;
            let topic = message.topic.clone();

            if let Err(err) = self.publisher.publish(message).await {
                tracing::warn!(outbox_id = id, topic = %topic, error = %err, "Outbox relay publish failed");
                failure = Some(err);
                break;
            }
            metrics::counter!("event_sender.sent", "topic" => topic).increment(1);
            relayed.push(id);
        }

        if !relayed.is_empty() {
            sqlx::query("DELETE FROM kafka_outbox WHERE id = ANY($1)")
                .bind(&relayed)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)?;

        match failure {
            Some(err) if relayed.is_empty() => Err(err),
            _ => Ok(relayed.len()),
        }
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<OutboundMessage, SenderError> {
        let headers: Option<serde_json::Value> = row.try_get("headers").map_err(db_error)?;
        let headers: EventHeaders = match headers {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| SenderError::Database(format!("invalid outbox headers: {e}")))?,
            None => EventHeaders::new(),
        };

        Ok(OutboundMessage {
            topic: row.try_get("topic").map_err(db_error)?,
            key: row.try_get("key").map_err(db_error)?,
            headers,
            payload: row.try_get("payload").map_err(db_error)?,
        })
    }

    /// Relay in the background until [`OutboxRelayTask::stop`] is called.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(self) -> OutboxRelayTask {
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                let idle = match self.relay_batch().await {
                    Ok(relayed) => {
                        if relayed > 0 {
                            tracing::debug!(relayed, "Outbox batch relayed");
                        }
                        i64::try_from(relayed).unwrap_or(i64::MAX) < self.batch_size
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Outbox relay failed");
                        true
                    }
                };

                if idle {
                    tokio::select! {
                        _ = &mut stopped => break,
                        () = tokio::time::sleep(self.poll_interval) => {}
                    }
                } else if !matches!(stopped.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                    break;
                }
            }
            tracing::debug!("Outbox relay stopped");
        });

        OutboxRelayTask {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl std::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Handle to a running [`OutboxRelay`].
#[derive(Debug)]
pub struct OutboxRelayTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl OutboxRelayTask {
    /// Stop after the current batch and wait for the task.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Outbox relay task failed");
            }
        }
    }
}

impl Drop for OutboxRelayTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
