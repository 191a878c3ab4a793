//! Event senders from a configuration string.
//!
//! Local senders (`noop`, `stdout`, `stderr`, `gzip`) come from
//! [`SenderSpec::build_local`]; `consul` and `confluent` become a
//! [`QueuedEventSender`] over a [`KafkaPublisher`].

use std::sync::Arc;
use txkit_core::{
    CachedRegistry, ConfigError, ConfluentEncoder, ContentHashEncoder, Encoder, EventSender,
    EventSenders, QueuedEventSender, SenderError, SenderKind, SenderSpec, TopicsFn,
    parse_senders,
};

use crate::publisher::KafkaPublisher;
use crate::registry::{ConfluentRegistry, ConsulRegistry};

/// Build every sender named in `config`.
///
/// `topics` receives the configured replication factor of each Kafka sender
/// and returns its routing table. When the table lists schema init events,
/// they are registered right after the sender starts; a failure is logged and
/// only aborts construction if the table asks for it.
///
/// # Errors
///
/// Returns [`SenderError::Config`] for an invalid string, or the error of the
/// first sender that cannot be built.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use txkit_core::{EventTopic, EventTopics};
/// use txkit_redpanda::build_event_senders;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let senders = build_event_senders(
///     "stdout consul,address=consul:8500,kafka=redpanda:9092,replication=3",
///     Arc::new(|replication| {
///         EventTopics::new(EventTopic::new("events").replication(replication))
///     }),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn build_event_senders(config: &str, topics: TopicsFn) -> Result<EventSenders, SenderError> {
    let specs = parse_senders(config)?;
    let mut senders = EventSenders::default();

    for spec in &specs {
        let sender = match spec.build_local()? {
            Some(sender) => sender,
            None => build_kafka_sender(spec, &topics).await?,
        };
        tracing::info!(sender = %spec.kind, "Event sender configured");
        senders = senders.with(sender);
    }

    if senders.is_empty() {
        tracing::warn!("No event senders configured, events will be discarded");
    }
    Ok(senders)
}

fn registry_error(err: txkit_core::SchemaError) -> SenderError {
    SenderError::Encode(err.into())
}

fn encoder_for(spec: &SenderSpec, address: &str) -> Result<Arc<dyn Encoder>, SenderError> {
    let encoder: Arc<dyn Encoder> = match spec.kind {
        SenderKind::Consul => {
            let registry = ConsulRegistry::new(address).map_err(registry_error)?;
            Arc::new(ContentHashEncoder::new(CachedRegistry::new(registry)))
        }
        SenderKind::Confluent => {
            let registry = ConfluentRegistry::new(address).map_err(registry_error)?;
            Arc::new(ConfluentEncoder::new(registry))
        }
        other => return Err(ConfigError::UnknownType(other.to_string()).into()),
    };
    Ok(encoder)
}

async fn build_kafka_sender(
    spec: &SenderSpec,
    topics: &TopicsFn,
) -> Result<Arc<dyn EventSender>, SenderError> {
    let missing = |argument: &str| ConfigError::MissingArgument {
        sender: spec.kind.to_string(),
        argument: argument.to_string(),
    };
    let address = spec.address().ok_or_else(|| missing("address"))?;
    let brokers = spec.kafka_brokers();
    if brokers.is_empty() {
        return Err(missing("kafka").into());
    }

    let buffer_size = spec.buffer_size()?;
    let topics = topics(spec.replication()?);
    let publisher = KafkaPublisher::new(&brokers.join(","))?;
    let encoder = encoder_for(spec, address)?;

    let init_events = topics.init_events().to_vec();
    let fail_on_init = topics.fails_on_schema_init();

    let sender = QueuedEventSender::builder(encoder, Arc::new(publisher), topics)
        .buffer_size(buffer_size)
        .blocking(spec.blocking())
        .build()
        .await?;

    if !init_events.is_empty() {
        if let Err(err) = sender.init(&init_events).await {
            tracing::error!(sender = %spec.kind, error = %err, "Event schema init failed");
            if fail_on_init {
                // stop the worker before reporting
                if let Err(close_err) = sender.close().await {
                    tracing::warn!(error = %close_err, "Closing event sender failed");
                }
                return Err(err);
            }
        }
    }

    Ok(Arc::new(sender))
}
