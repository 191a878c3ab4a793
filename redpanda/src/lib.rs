//! Kafka-compatible event publishing for txkit.
//!
//! - [`KafkaPublisher`]: the [`txkit_core::Publisher`] behind the queued event
//!   sender, built on rdkafka. Works with Redpanda, Apache Kafka or MSK.
//! - [`ConsulRegistry`] and [`ConfluentRegistry`]: schema registries over HTTP.
//! - [`build_event_senders`]: turns the sender configuration string into
//!   running senders.
//!
//! # Delivery
//!
//! Events are published at most once from the in-memory queue. Use the
//! Postgres outbox when an event must not be lost together with the
//! transaction that produced it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use txkit_core::{Envelope, EventSender, EventTopic, EventTopics};
//! use txkit_redpanda::build_event_senders;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let senders = build_event_senders(
//!     "confluent,address=http://registry:8081,kafka=redpanda:9092",
//!     Arc::new(|replication| {
//!         EventTopics::new(EventTopic::new("events").replication(replication))
//!     }),
//! )
//! .await?;
//!
//! // ... send events ...
//!
//! senders.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod publisher;
mod registry;
mod senders;

pub use publisher::{KafkaPublisher, KafkaPublisherBuilder};
pub use registry::{CONFLUENT_TIMEOUT, ConfluentRegistry, ConsulRegistry};
pub use senders::build_event_senders;
