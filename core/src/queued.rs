//! Buffered event sender with a single background worker.
//!
//! ```text
//! send() ──try_send──▶ [bounded queue] ──▶ worker ──encode──▶ publisher ──▶ topic
//!                                             │
//!                                             └─ on failure: JSON ──▶ event_sender_errors
//! ```
//!
//! The worker is the only consumer, so events leave the queue in the order they
//! were accepted. Every accepted event is either published to its topic or
//! rerouted to [`ERROR_TOPIC`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ConfigError;
use crate::encoder::Encoder;
use crate::event::{Envelope, Event, EventHeader};
use crate::sender::{EventSender, OutboundMessage, Publisher, SenderError};
use crate::topics::{ERROR_TOPIC, EventTopics};

/// Default queue capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default bound on [`EventSender::close`].
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on [`QueuedEventSender::send_sync`].
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the failure reason on rerouted events.
pub const ERROR_HEADER: &str = "error";

/// Header carrying the original event type on rerouted events.
pub const EVENT_TYPE_HEADER: &str = "event_type";

struct Pipeline {
    encoder: Arc<dyn Encoder>,
    publisher: Arc<dyn Publisher>,
    topics: EventTopics,
}

impl Pipeline {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SenderError> {
        let topic = self.topics.topic_for(&*envelope.event);
        let payload = self.encoder.encode(&*envelope.event).await?;
        self.publisher
            .publish(OutboundMessage {
                topic: topic.name.clone(),
                key: envelope.key.clone(),
                headers: envelope.headers.clone(),
                payload,
            })
            .await?;

        metrics::counter!("event_sender.sent", "topic" => topic.name.clone()).increment(1);
        Ok(())
    }

    async fn reroute(&self, envelope: Envelope, error: &SenderError) {
        tracing::warn!(
            event_type = envelope.event_type(),
            error = %error,
            "Event delivery failed, rerouting to error topic"
        );
        metrics::counter!("event_sender.rerouted").increment(1);

        let payload = match envelope.event.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(
                    event_type = envelope.event_type(),
                    error = %err,
                    "Could not serialize event for the error topic, event lost"
                );
                return;
            }
        };

        let mut headers = envelope.headers.clone();
        headers.push(EventHeader {
            key: ERROR_HEADER.to_string(),
            value: error.to_string(),
        });
        headers.push(EventHeader {
            key: EVENT_TYPE_HEADER.to_string(),
            value: envelope.event_type().to_string(),
        });

        let message = OutboundMessage {
            topic: ERROR_TOPIC.to_string(),
            key: envelope.key,
            headers,
            payload,
        };
        if let Err(err) = self.publisher.publish(message).await {
            tracing::error!(error = %err, "Failed to publish to error topic, event lost");
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        if let Err(err) = self.deliver(&envelope).await {
            self.reroute(envelope, &err).await;
        }
    }
}

async fn run_worker(pipeline: Arc<Pipeline>, mut queue: mpsc::Receiver<Envelope>) {
    tracing::debug!("Event sender worker started");
    while let Some(envelope) = queue.recv().await {
        pipeline.dispatch(envelope).await;
    }
    tracing::debug!("Event sender worker drained queue and stopped");
}

/// Event sender backed by a bounded queue and one worker task.
///
/// Built with [`QueuedEventSender::builder`]. Building creates every declared
/// topic plus the error topic before the worker starts.
///
/// # Example
///
/// ```rust,ignore
/// let sender = QueuedEventSender::builder(encoder, publisher, topics)
///     .buffer_size(4096)
///     .build()
///     .await?;
///
/// sender.send(Envelope::new(OrderPlaced { id: 42 })).await;
/// sender.close().await?;
/// ```
pub struct QueuedEventSender {
    pipeline: Arc<Pipeline>,
    queue: Mutex<Option<mpsc::Sender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
    blocking: bool,
    close_timeout: Duration,
    sync_timeout: Duration,
    dropped: AtomicU64,
}

impl QueuedEventSender {
    /// Start building a sender.
    #[must_use]
    pub fn builder(
        encoder: Arc<dyn Encoder>,
        publisher: Arc<dyn Publisher>,
        topics: EventTopics,
    ) -> QueuedEventSenderBuilder {
        QueuedEventSenderBuilder {
            encoder,
            publisher,
            topics,
            buffer_size: DEFAULT_BUFFER_SIZE,
            blocking: false,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    /// Number of events dropped because the queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether `send` waits for queue space instead of dropping.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Queue capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Encode and publish `envelope` right away, bypassing the queue.
    ///
    /// # Errors
    ///
    /// Returns the encode or publish error, or [`SenderError::Timeout`]. Failed
    /// events are not rerouted.
    pub async fn send_sync(&self, envelope: Envelope) -> Result<(), SenderError> {
        tokio::time::timeout(self.sync_timeout, self.pipeline.deliver(&envelope))
            .await
            .map_err(|_| SenderError::Timeout(self.sync_timeout))?
    }

    fn queue(&self) -> Option<mpsc::Sender<Envelope>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_drop(&self, envelope: &Envelope) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("event_sender.dropped").increment(1);
        tracing::error!(
            event_type = envelope.event_type(),
            "Could not enqueue event, channel size of {} reached",
            self.capacity
        );
    }

    async fn drain(&self, deadline: Instant) -> Result<(), SenderError> {
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner).take());

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };

        match tokio::time::timeout_at(deadline, worker).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SenderError::Worker(err.to_string())),
            Err(_) => Err(SenderError::Timeout(self.close_timeout)),
        }
    }
}

impl EventSender for QueuedEventSender {
    fn init<'a>(
        &'a self,
        events: &'a [Arc<dyn Event>],
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>> {
        Box::pin(async move {
            for event in events {
                self.pipeline.encoder.encode(&**event).await?;
                tracing::debug!(event_type = event.event_type(), "Schema registered");
            }
            Ok(())
        })
    }

    fn send(&self, envelope: Envelope) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(queue) = self.queue() else {
                tracing::warn!(
                    event_type = envelope.event_type(),
                    "Event sender is closed, discarding event"
                );
                return;
            };

            if self.blocking {
                if queue.send(envelope).await.is_err() {
                    tracing::warn!("Event sender closed while waiting for queue space");
                }
                return;
            }

            match queue.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(envelope)) => self.record_drop(&envelope),
                Err(TrySendError::Closed(envelope)) => {
                    tracing::warn!(
                        event_type = envelope.event_type(),
                        "Event sender is closed, discarding event"
                    );
                }
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        Box::pin(async move {
            let deadline = Instant::now() + self.close_timeout;
            let drained = self.drain(deadline).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let flushed = self.pipeline.publisher.flush(remaining).await;
            let closed = self.pipeline.encoder.close().await.map_err(SenderError::from);

            tracing::info!(dropped = self.dropped_events(), "Event sender closed");
            drained.and(flushed).and(closed)
        })
    }
}

impl std::fmt::Debug for QueuedEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedEventSender")
            .field("capacity", &self.capacity)
            .field("blocking", &self.blocking)
            .field("dropped", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

/// Builder for [`QueuedEventSender`].
pub struct QueuedEventSenderBuilder {
    encoder: Arc<dyn Encoder>,
    publisher: Arc<dyn Publisher>,
    topics: EventTopics,
    buffer_size: usize,
    blocking: bool,
    close_timeout: Duration,
    sync_timeout: Duration,
}

impl QueuedEventSenderBuilder {
    /// Queue capacity (default 1024).
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Wait for queue space instead of dropping events (default `false`).
    #[must_use]
    pub const fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Bound on draining and flushing in `close` (default 15 s).
    #[must_use]
    pub const fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Bound on [`QueuedEventSender::send_sync`] (default 5 s).
    #[must_use]
    pub const fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Create the topics and start the worker.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Config`] for a zero buffer size, or the error
    /// from creating topics.
    pub async fn build(self) -> Result<QueuedEventSender, SenderError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                argument: "bufferSize".to_string(),
                value: "0".to_string(),
            }
            .into());
        }

        let topics = self.topics.with_error_topic();
        self.publisher.ensure_topics(&topics).await?;
        tracing::info!(
            topics = topics.len(),
            buffer_size = self.buffer_size,
            blocking = self.blocking,
            "Event sender topics ready"
        );

        let pipeline = Arc::new(Pipeline {
            encoder: self.encoder,
            publisher: self.publisher,
            topics: self.topics,
        });
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let worker = tokio::spawn(run_worker(Arc::clone(&pipeline), rx));

        Ok(QueuedEventSender {
            pipeline,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            capacity: self.buffer_size,
            blocking: self.blocking,
            close_timeout: self.close_timeout,
            sync_timeout: self.sync_timeout,
            dropped: AtomicU64::new(0),
        })
    }
}
