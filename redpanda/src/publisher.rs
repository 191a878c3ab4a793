//! rdkafka-backed [`Publisher`].

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use txkit_core::{ConfigError, EventTopic, OutboundMessage, Publisher, SenderError};

/// Publishes to Kafka-compatible brokers (Redpanda, Apache Kafka, MSK, ...).
///
/// # Example
///
/// ```no_run
/// use txkit_redpanda::KafkaPublisher;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = KafkaPublisher::builder()
///     .brokers("localhost:9092")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaPublisher {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    brokers: String,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Publisher with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Publish`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, SenderError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the publisher.
    #[must_use]
    pub fn builder() -> KafkaPublisherBuilder {
        KafkaPublisherBuilder::default()
    }

    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

impl std::fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPublisher")
            .field("brokers", &self.brokers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn new_topic(topic: &EventTopic) -> NewTopic<'_> {
    topic.config.iter().fold(
        NewTopic::new(
            &topic.name,
            topic.partitions,
            TopicReplication::Fixed(topic.replication),
        ),
        |new_topic, (key, value)| new_topic.set(key, value),
    )
}

fn owned_headers(message: &OutboundMessage) -> OwnedHeaders {
    message
        .headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(message.headers.len()), |headers, h| {
            headers.insert(Header {
                key: &h.key,
                value: Some(h.value.as_bytes()),
            })
        })
}

impl Publisher for KafkaPublisher {
    fn ensure_topics<'a>(
        &'a self,
        topics: &'a [EventTopic],
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + 'a>> {
        Box::pin(async move {
            let new_topics: Vec<NewTopic<'_>> = topics.iter().map(new_topic).collect();
            let options = AdminOptions::new().operation_timeout(Some(self.timeout));

            let results = self
                .admin
                .create_topics(&new_topics, &options)
                .await
                .map_err(|e| SenderError::Topic(e.to_string()))?;

            for result in results {
                match result {
                    Ok(name) => tracing::info!(topic = %name, "Topic created"),
                    Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        tracing::debug!(topic = %name, "Topic already exists");
                    }
                    Err((name, code)) => {
                        return Err(SenderError::Topic(format!("{name}: {code}")));
                    }
                }
            }
            Ok(())
        })
    }

    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        Box::pin(async move {
            let mut record: FutureRecord<'_, str, Vec<u8>> = FutureRecord::to(&message.topic)
                .payload(&message.payload)
                .headers(owned_headers(&message));
            if let Some(key) = &message.key {
                record = record.key(key.as_str());
            }

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::trace!(
                        topic = %message.topic,
                        partition,
                        offset,
                        "Message delivered"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => Err(SenderError::Publish(format!(
                    "{}: {kafka_error}",
                    message.topic
                ))),
            }
        })
    }

    fn flush(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        let producer = self.producer.clone();
        Box::pin(async move {
            // librdkafka's flush blocks the calling thread
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| SenderError::Worker(e.to_string()))?
                .map_err(|_| SenderError::Timeout(timeout))
        })
    }
}

/// Builder for [`KafkaPublisher`].
#[derive(Debug, Default)]
pub struct KafkaPublisherBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    overrides: Vec<(String, String)>,
}

impl KafkaPublisherBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Acknowledgment mode: `"0"`, `"1"` or `"all"` (default `"all"`).
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`
    /// (default `"none"`).
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery and admin operation timeout (default 5 s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Any other librdkafka property.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Build the [`KafkaPublisher`].
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Config`] without brokers, or
    /// [`SenderError::Publish`] if librdkafka rejects the configuration.
    pub fn build(self) -> Result<KafkaPublisher, SenderError> {
        let brokers = self.brokers.ok_or_else(|| ConfigError::MissingArgument {
            sender: "kafka".to_string(),
            argument: "brokers".to_string(),
        })?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression);
        for (key, value) in &self.overrides {
            config.set(key, value);
        }

        let producer: FutureProducer = config
            .create()
            .map_err(|e| SenderError::Publish(format!("Failed to create producer: {e}")))?;
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| SenderError::Publish(format!("Failed to create admin client: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            "Kafka publisher created"
        );

        Ok(KafkaPublisher {
            producer,
            admin,
            brokers,
            timeout,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use txkit_core::EventHeader;

    #[test]
    fn kafka_publisher_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaPublisher>();
        assert_sync::<KafkaPublisher>();
    }

    #[test]
    fn test_build_requires_brokers() {
        let err = KafkaPublisher::builder().build().unwrap_err();
        assert!(matches!(err, SenderError::Config(ConfigError::MissingArgument { .. })));
    }

    #[test]
    fn test_new_topic_carries_config() {
        let topic = EventTopic::new("orders")
            .partitions(3)
            .replication(2)
            .config("retention.ms", "86400000");
        let new_topic = new_topic(&topic);
        assert_eq!(new_topic.name, "orders");
        assert_eq!(new_topic.num_partitions, 3);
        assert_eq!(new_topic.config, vec![("retention.ms", "86400000")]);
    }

    #[test]
    fn test_headers_keep_order() {
        use rdkafka::message::Headers;

        let message = OutboundMessage {
            topic: "orders".to_string(),
            key: None,
            headers: [
                EventHeader {
                    key: "a".to_string(),
                    value: "1".to_string(),
                },
                EventHeader {
                    key: "b".to_string(),
                    value: "2".to_string(),
                },
            ]
            .into_iter()
            .collect(),
            payload: Vec::new(),
        };

        let headers = owned_headers(&message);
        assert_eq!(headers.count(), 2);
        assert_eq!(headers.get(1).key, "b");
        assert_eq!(headers.get(1).value, Some(&b"2"[..]));
    }
}
