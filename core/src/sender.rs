//! Event sender traits and the simple senders.
//!
//! - [`EventSender`]: fire-and-forget dispatch. Failures are logged or rerouted,
//!   never returned to the caller of `send`.
//! - [`TransactionalSender`]: writes the event inside the caller's transaction
//!   (outbox). Errors are returned so the transaction can roll back.
//! - [`Publisher`]: the broker seam used by the queued sender.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::event::{EncodeError, Envelope, Event, EventHeaders};
use crate::topics::EventTopic;
use crate::transaction::{TxContext, TxError, TxHandle};

/// Errors produced by event senders and publishers.
#[derive(Error, Debug, Clone)]
pub enum SenderError {
    /// The sender was closed
    #[error("Sender is closed")]
    Closed,

    /// Encoding the event failed
    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),

    /// The broker rejected or did not acknowledge the message
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Creating or checking topics failed
    #[error("Topic setup failed: {0}")]
    Topic(String),

    /// Local output failed
    #[error("I/O error: {0}")]
    Io(String),

    /// An operation did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The background worker died
    #[error("Worker failed: {0}")]
    Worker(String),

    /// Writing to the outbox failed
    #[error("Database error: {0}")]
    Database(String),

    /// Invalid sender configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<TxError> for SenderError {
    fn from(err: TxError) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<SenderError> for TxError {
    fn from(err: SenderError) -> Self {
        Self::app(err)
    }
}

/// Asynchronous event dispatch.
pub trait EventSender: Send + Sync {
    /// Register the schemas of `events` without publishing them.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError`] if a schema cannot be registered.
    fn init<'a>(
        &'a self,
        events: &'a [Arc<dyn Event>],
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>> {
        let _ = events;
        Box::pin(async { Ok(()) })
    }

    /// Hand an event to the sender.
    fn send(&self, envelope: Envelope) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Stop accepting events, deliver what was accepted and release resources.
    ///
    /// Calling `close` more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError`] if draining or flushing fails or times out.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>>;
}

/// Writes events as part of an open transaction.
pub trait TransactionalSender<T: TxHandle>: Send + Sync {
    /// Encode `envelope` and store it using the transaction in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError`] if encoding or the insert fails.
    fn send_in_tx<'a>(
        &'a self,
        ctx: &'a mut TxContext<T>,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>>;
}

/// A fully encoded message ready for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    /// Message headers
    pub headers: EventHeaders,
    /// Encoded payload
    pub payload: Vec<u8>,
}

/// Broker client used by the queued sender and the outbox relay.
pub trait Publisher: Send + Sync {
    /// Create missing topics.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Topic`] if a topic cannot be created.
    fn ensure_topics<'a>(
        &'a self,
        topics: &'a [EventTopic],
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>>;

    /// Publish one message and wait for the acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Publish`] if delivery fails.
    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>>;

    /// Wait for in-flight messages, at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Timeout`] if messages are still in flight.
    fn flush(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>>;
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn ensure_topics<'a>(
        &'a self,
        topics: &'a [EventTopic],
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>> {
        (**self).ensure_topics(topics)
    }

    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        (**self).publish(message)
    }

    fn flush(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        (**self).flush(timeout)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSender;

impl EventSender for NoopEventSender {
    fn send(&self, envelope: Envelope) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        tracing::trace!(event_type = envelope.event_type(), "Discarding event");
        Box::pin(async {})
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Sends every event to all wrapped senders, in order.
#[derive(Clone, Default)]
pub struct EventSenders {
    senders: Vec<Arc<dyn EventSender>>,
}

impl EventSenders {
    /// Fan out to `senders`.
    #[must_use]
    pub fn new(senders: Vec<Arc<dyn EventSender>>) -> Self {
        Self { senders }
    }

    /// Add another sender.
    #[must_use]
    pub fn with(mut self, sender: Arc<dyn EventSender>) -> Self {
        self.senders.push(sender);
        self
    }

    /// Number of wrapped senders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Whether no sender is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl std::fmt::Debug for EventSenders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSenders")
            .field("senders", &self.senders.len())
            .finish()
    }
}

impl EventSender for EventSenders {
    fn init<'a>(
        &'a self,
        events: &'a [Arc<dyn Event>],
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>> {
        Box::pin(async move {
            for sender in &self.senders {
                sender.init(events).await?;
            }
            Ok(())
        })
    }

    fn send(&self, envelope: Envelope) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            for sender in &self.senders {
                sender.send(envelope.clone()).await;
            }
        })
    }

    /// Closes every sender even if one fails. Returns the first error.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        Box::pin(async move {
            let mut first_error = None;
            for sender in &self.senders {
                if let Err(err) = sender.close().await {
                    tracing::error!(error = %err, "Failed to close event sender");
                    first_error.get_or_insert(err);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }
}
