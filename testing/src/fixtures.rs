//! Sample events for tests.

use serde::{Deserialize, Serialize};

/// Avro schema of [`OrderPlaced`].
pub const ORDER_PLACED_SCHEMA: &str = r#"{
    "type": "record",
    "name": "OrderPlaced",
    "namespace": "txkit.fixtures",
    "fields": [
        {"name": "id", "type": "long"},
        {"name": "customer", "type": "string"}
    ]
}"#;

/// Avro schema of [`OrderCancelled`].
pub const ORDER_CANCELLED_SCHEMA: &str = r#"{
    "type": "record",
    "name": "OrderCancelled",
    "namespace": "txkit.fixtures",
    "fields": [
        {"name": "id", "type": "long"},
        {"name": "reason", "type": ["null", "string"], "default": null}
    ]
}"#;

/// An order was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// Order id
    pub id: i64,
    /// Customer name
    pub customer: String,
}

impl OrderPlaced {
    /// Order `id` for customer `alice`.
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self {
            id,
            customer: "alice".to_string(),
        }
    }
}

txkit_core::avro_event!(OrderPlaced, ORDER_PLACED_SCHEMA);

/// An order was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    /// Order id
    pub id: i64,
    /// Optional reason
    pub reason: Option<String>,
}

txkit_core::avro_event!(OrderCancelled, ORDER_CANCELLED_SCHEMA);

/// An event whose payload does not match its schema, so encoding fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Malformed {
    /// Declared as `long` in the schema
    pub id: String,
}

txkit_core::avro_event!(
    Malformed,
    r#"{"type":"record","name":"Malformed","fields":[{"name":"id","type":"long"}]}"#
);
