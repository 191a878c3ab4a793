//! Publisher that records messages instead of talking to a broker.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only poisoned locks panic

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use txkit_core::{EventTopic, OutboundMessage, Publisher, SenderError};

/// Records published messages and created topics.
///
/// [`pause`](Self::pause) blocks publishing until the returned guard is
/// dropped, which lets tests fill a sender's queue.
///
/// # Example
///
/// ```
/// use txkit_testing::RecordingPublisher;
///
/// let publisher = RecordingPublisher::new();
/// publisher.fail_topic("orders");
/// assert!(publisher.messages().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
    topics: Arc<Mutex<Vec<EventTopic>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    gate: Arc<RwLock<()>>,
    flushes: Arc<AtomicUsize>,
}

impl RecordingPublisher {
    /// Create an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Messages published to `topic`.
    #[must_use]
    pub fn messages_for(&self, topic: &str) -> Vec<OutboundMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Topics passed to `ensure_topics`.
    #[must_use]
    pub fn topics(&self) -> Vec<EventTopic> {
        self.topics.lock().unwrap().clone()
    }

    /// Number of `flush` calls.
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Reject every message for `topic`.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.failing.lock().unwrap().insert(topic.into());
    }

    /// Block publishing until the guard is dropped.
    pub async fn pause(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.gate).write_owned().await
    }
}

impl Publisher for RecordingPublisher {
    fn ensure_topics<'a>(
        &'a self,
        topics: &'a [EventTopic],
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>> {
        self.topics.lock().unwrap().extend_from_slice(topics);
        Box::pin(async { Ok(()) })
    }

    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        Box::pin(async move {
            let _open = self.gate.read().await;
            if self.failing.lock().unwrap().contains(&message.topic) {
                return Err(SenderError::Publish(format!(
                    "topic {} rejected the message",
                    message.topic
                )));
            }
            self.messages.lock().unwrap().push(message);
            Ok(())
        })
    }

    fn flush(
        &self,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}
