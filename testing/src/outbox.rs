//! Transactional outbox on top of [`InMemoryDatabase`].

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use txkit_core::{
    Encoder, Envelope, EventHeaders, EventTopics, SenderError, TransactionalSender, TxContext,
};

use crate::database::{InMemoryDatabase, InMemoryTx};

const PREFIX: &str = "outbox:";

/// A stored outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    /// Message headers
    pub headers: EventHeaders,
    /// Schema of the event
    pub schema: String,
    /// Encoded payload
    pub payload: Vec<u8>,
}

/// Writes events into the caller's in-memory transaction.
pub struct InMemoryOutbox {
    encoder: Arc<dyn Encoder>,
    topics: EventTopics,
    sequence: AtomicU64,
}

impl InMemoryOutbox {
    /// Encode with `encoder` and route with `topics`.
    #[must_use]
    pub fn new(encoder: Arc<dyn Encoder>, topics: EventTopics) -> Self {
        Self {
            encoder,
            topics,
            sequence: AtomicU64::new(0),
        }
    }

    /// Committed rows in insertion order.
    #[must_use]
    pub fn rows(db: &InMemoryDatabase) -> Vec<OutboxRow> {
        db.scan(PREFIX)
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect()
    }
}

impl std::fmt::Debug for InMemoryOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutbox")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl TransactionalSender<InMemoryTx> for InMemoryOutbox {
    fn send_in_tx<'a>(
        &'a self,
        ctx: &'a mut TxContext<InMemoryTx>,
        envelope: Envelope,
    ) -> BoxFuture<'a, Result<(), SenderError>> {
        Box::pin(async move {
            let payload = self.encoder.encode(&*envelope.event).await?;
            let row = OutboxRow {
                topic: self.topics.topic_for(&*envelope.event).name.clone(),
                key: envelope.key.clone(),
                headers: envelope.headers.clone(),
                schema: envelope.event.schema().to_string(),
                payload,
            };
            let bytes = serde_json::to_vec(&row).map_err(|e| SenderError::Database(e.to_string()))?;

            let id = self.sequence.fetch_add(1, Ordering::SeqCst);
            ctx.tx()?.put(format!("{PREFIX}{id:020}"), bytes);
            Ok(())
        })
    }
}
