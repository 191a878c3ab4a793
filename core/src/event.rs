//! Domain events and the envelopes they travel in.
//!
//! An [`Event`] knows its Avro schema, can serialize itself to an Avro datum and
//! can fall back to JSON. Most events are plain serde structs that get their
//! implementation from [`avro_event!`](crate::avro_event):
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     id: i64,
//! }
//!
//! txkit_core::avro_event!(OrderPlaced, r#"{
//!     "type": "record",
//!     "name": "OrderPlaced",
//!     "namespace": "shop.orders",
//!     "fields": [{"name": "id", "type": "long"}]
//! }"#);
//!
//! sender.send(Envelope::new(OrderPlaced { id: 42 }).with_key("42")).await;
//! ```

use apache_avro::Schema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use smallvec::SmallVec;
use std::sync::Arc;
use thiserror::Error;

use crate::schema::SchemaError;

/// Errors that can occur while encoding or decoding events.
#[derive(Error, Debug, Clone)]
pub enum EncodeError {
    /// The event's schema text is not a valid Avro schema
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// The payload could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The payload could not be deserialized
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// The bytes do not carry a recognizable wire header
    #[error("Invalid wire format: {0}")]
    InvalidFormat(String),

    /// Schema registry failure
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// A domain event that can be published.
///
/// `event_type` is what topics are mapped by. Wrappers (`Box`, `Arc`, `&`)
/// delegate to the wrapped event, so a boxed event routes exactly like the
/// plain value.
pub trait Event: Send + Sync {
    /// Short type name used for topic routing.
    fn event_type(&self) -> &str;

    /// Avro schema JSON describing the payload.
    fn schema(&self) -> &str;

    /// Serialize the payload as a raw Avro datum (no framing).
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the payload does not match the schema.
    fn to_avro_datum(&self) -> Result<Vec<u8>, EncodeError>;

    /// Serialize the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Serialization`] if JSON serialization fails.
    fn to_json(&self) -> Result<Vec<u8>, EncodeError>;
}

impl<E: Event + ?Sized> Event for Box<E> {
    fn event_type(&self) -> &str {
        (**self).event_type()
    }

    fn schema(&self) -> &str {
        (**self).schema()
    }

    fn to_avro_datum(&self) -> Result<Vec<u8>, EncodeError> {
        (**self).to_avro_datum()
    }

    fn to_json(&self) -> Result<Vec<u8>, EncodeError> {
        (**self).to_json()
    }
}

impl<E: Event + ?Sized> Event for Arc<E> {
    fn event_type(&self) -> &str {
        (**self).event_type()
    }

    fn schema(&self) -> &str {
        (**self).schema()
    }

    fn to_avro_datum(&self) -> Result<Vec<u8>, EncodeError> {
        (**self).to_avro_datum()
    }

    fn to_json(&self) -> Result<Vec<u8>, EncodeError> {
        (**self).to_json()
    }
}

impl<E: Event + ?Sized> Event for &E {
    fn event_type(&self) -> &str {
        (**self).event_type()
    }

    fn schema(&self) -> &str {
        (**self).schema()
    }

    fn to_avro_datum(&self) -> Result<Vec<u8>, EncodeError> {
        (**self).to_avro_datum()
    }

    fn to_json(&self) -> Result<Vec<u8>, EncodeError> {
        (**self).to_json()
    }
}

/// A message header attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct EventHeader {
    /// Header name
    pub key: String,
    /// Header value
    pub value: String,
}

/// Header list; most events carry none or very few.
pub type EventHeaders = SmallVec<[EventHeader; 2]>;

/// An event plus its routing key and headers.
#[derive(Clone)]
pub struct Envelope {
    /// The event payload
    pub event: Arc<dyn Event>,
    /// Optional message key (partitioning)
    pub key: Option<String>,
    /// Message headers
    pub headers: EventHeaders,
}

impl Envelope {
    /// Wrap an event without key or headers.
    #[must_use]
    pub fn new(event: impl Event + 'static) -> Self {
        Self {
            event: Arc::new(event),
            key: None,
            headers: SmallVec::new(),
        }
    }

    /// Wrap an already shared event.
    #[must_use]
    pub fn from_arc(event: Arc<dyn Event>) -> Self {
        Self {
            event,
            key: None,
            headers: SmallVec::new(),
        }
    }

    /// Set the message key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(EventHeader {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// The wrapped event's type name.
    #[must_use]
    pub fn event_type(&self) -> &str {
        self.event.event_type()
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("event_type", &self.event.event_type())
            .field("key", &self.key)
            .field("headers", &self.headers)
            .finish()
    }
}

impl<E: Event + 'static> From<E> for Envelope {
    fn from(event: E) -> Self {
        Self::new(event)
    }
}

/// Last path segment of a type's name (`shop::OrderPlaced` -> `OrderPlaced`).
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Parse Avro schema text.
///
/// # Errors
///
/// Returns [`EncodeError::InvalidSchema`] if the text is not a valid schema.
pub fn parse_schema(schema: &str) -> Result<Schema, EncodeError> {
    Schema::parse_str(schema).map_err(|e| EncodeError::InvalidSchema(e.to_string()))
}

/// Serialize `value` as a raw Avro datum using `schema`.
///
/// # Errors
///
/// Returns [`EncodeError`] if the schema is invalid or the value does not fit it.
pub fn avro_datum<T: Serialize + ?Sized>(value: &T, schema: &str) -> Result<Vec<u8>, EncodeError> {
    let schema = parse_schema(schema)?;
    let value = apache_avro::to_value(value)
        .and_then(|v| v.resolve(&schema))
        .map_err(|e| EncodeError::Serialization(e.to_string()))?;
    apache_avro::to_avro_datum(&schema, value).map_err(|e| EncodeError::Serialization(e.to_string()))
}

/// Deserialize a raw Avro datum written with `schema`.
///
/// # Errors
///
/// Returns [`EncodeError`] if the schema is invalid or the bytes do not decode.
pub fn from_avro_datum<T: DeserializeOwned>(schema: &str, mut bytes: &[u8]) -> Result<T, EncodeError> {
    let schema = parse_schema(schema)?;
    let value = apache_avro::from_avro_datum(&schema, &mut bytes, None)
        .map_err(|e| EncodeError::Deserialization(e.to_string()))?;
    apache_avro::from_value(&value).map_err(|e| EncodeError::Deserialization(e.to_string()))
}

/// Serialize `value` as JSON bytes.
///
/// # Errors
///
/// Returns [`EncodeError::Serialization`] if serde fails.
pub fn json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(value).map_err(|e| EncodeError::Serialization(e.to_string()))
}

/// Implement [`Event`] for a serde type with a fixed Avro schema.
///
/// The event type is the type's short name.
///
/// # Example
///
/// ```rust,ignore
/// txkit_core::avro_event!(OrderPlaced, ORDER_PLACED_SCHEMA);
/// ```
#[macro_export]
macro_rules! avro_event {
    ($ty:ty, $schema:expr) => {
        impl $crate::event::Event for $ty {
            fn event_type(&self) -> &str {
                $crate::event::short_type_name::<$ty>()
            }

            fn schema(&self) -> &str {
                $schema
            }

            fn to_avro_datum(&self) -> ::std::result::Result<::std::vec::Vec<u8>, $crate::event::EncodeError> {
                $crate::event::avro_datum(self, $schema)
            }

            fn to_json(&self) -> ::std::result::Result<::std::vec::Vec<u8>, $crate::event::EncodeError> {
                $crate::event::json_bytes(self)
            }
        }
    };
}
