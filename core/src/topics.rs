//! Topic declarations and event-type routing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::event::{Event, short_type_name};

/// Topic receiving events that could not be encoded or published.
pub const ERROR_TOPIC: &str = "event_sender_errors";

/// Partition count of [`ERROR_TOPIC`].
pub const ERROR_TOPIC_PARTITIONS: i32 = 9;

/// A broker topic and how to create it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTopic {
    /// Topic name
    pub name: String,
    /// Number of partitions
    pub partitions: i32,
    /// Replication factor
    pub replication: i32,
    /// Broker-specific config overrides (`retention.ms`, `cleanup.policy`, ...)
    pub config: BTreeMap<String, String>,
}

impl EventTopic {
    /// A topic with one partition and replication factor one.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 1,
            replication: 1,
            config: BTreeMap::new(),
        }
    }

    /// Set the partition count.
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the replication factor.
    #[must_use]
    pub const fn replication(mut self, replication: i32) -> Self {
        self.replication = replication;
        self
    }

    /// Add a config override.
    #[must_use]
    pub fn config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Maps event types to topics.
///
/// Events are looked up by [`Event::event_type`], so `Box<E>`, `Arc<E>` and `&E`
/// route exactly like `E`. Unmapped types go to the fallback topic.
#[derive(Clone)]
pub struct EventTopics {
    by_type: HashMap<String, EventTopic>,
    fallback: EventTopic,
    schema_init_events: Vec<Arc<dyn Event>>,
    fail_on_schema_init: bool,
}

impl EventTopics {
    /// Routing table with only a fallback topic.
    #[must_use]
    pub fn new(fallback: EventTopic) -> Self {
        Self {
            by_type: HashMap::new(),
            fallback,
            schema_init_events: Vec::new(),
            fail_on_schema_init: false,
        }
    }

    /// Route events whose type name is `event_type` to `topic`.
    #[must_use]
    pub fn map(mut self, event_type: impl Into<String>, topic: EventTopic) -> Self {
        self.by_type.insert(event_type.into(), topic);
        self
    }

    /// Route events of type `E` to `topic`.
    #[must_use]
    pub fn map_type<E: ?Sized>(self, topic: EventTopic) -> Self {
        self.map(short_type_name::<E>(), topic)
    }

    /// Events whose schemas are registered when the sender starts.
    #[must_use]
    pub fn schema_init_events(mut self, events: Vec<Arc<dyn Event>>) -> Self {
        self.schema_init_events = events;
        self
    }

    /// Fail sender construction if schema registration at startup fails.
    #[must_use]
    pub const fn fail_on_schema_init(mut self, fail: bool) -> Self {
        self.fail_on_schema_init = fail;
        self
    }

    /// Events to pass to `init` at startup.
    #[must_use]
    pub fn init_events(&self) -> &[Arc<dyn Event>] {
        &self.schema_init_events
    }

    /// Whether a failing `init` is fatal.
    #[must_use]
    pub const fn fails_on_schema_init(&self) -> bool {
        self.fail_on_schema_init
    }

    /// The fallback topic.
    #[must_use]
    pub const fn fallback(&self) -> &EventTopic {
        &self.fallback
    }

    /// Topic for `event`, logging when the fallback is used.
    #[must_use]
    pub fn topic_for(&self, event: &dyn Event) -> &EventTopic {
        self.by_type.get(event.event_type()).unwrap_or_else(|| {
            tracing::warn!(
                event_type = event.event_type(),
                topic = %self.fallback.name,
                "No topic mapped for event type, using fallback"
            );
            &self.fallback
        })
    }

    /// Every declared topic, fallback included, without duplicates.
    #[must_use]
    pub fn topics(&self) -> Vec<EventTopic> {
        let mut topics: BTreeMap<&str, &EventTopic> = BTreeMap::new();
        topics.insert(&self.fallback.name, &self.fallback);
        for topic in self.by_type.values() {
            topics.entry(&topic.name).or_insert(topic);
        }
        topics.into_values().cloned().collect()
    }

    /// [`topics`](Self::topics) plus the error topic. Its replication factor is
    /// the highest of the others, at least one.
    #[must_use]
    pub fn with_error_topic(&self) -> Vec<EventTopic> {
        let mut topics = self.topics();
        let replication = topics.iter().map(|t| t.replication).max().unwrap_or(1).max(1);
        topics.retain(|t| t.name != ERROR_TOPIC);
        topics.push(
            EventTopic::new(ERROR_TOPIC)
                .partitions(ERROR_TOPIC_PARTITIONS)
                .replication(replication),
        );
        topics
    }
}

impl std::fmt::Debug for EventTopics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTopics")
            .field("by_type", &self.by_type)
            .field("fallback", &self.fallback)
            .field("schema_init_events", &self.schema_init_events.len())
            .field("fail_on_schema_init", &self.fail_on_schema_init)
            .finish()
    }
}

/// Builds the routing table for a replication factor chosen in configuration.
pub type TopicsFn = Arc<dyn Fn(i32) -> EventTopics + Send + Sync>;
