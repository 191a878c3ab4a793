//! # txkit core
//!
//! Transactions, idempotency and event dispatch primitives.
//!
//! ## Core Concepts
//!
//! - **Transactions**: [`TransactionRunner`] runs closures in a new, existing or
//!   any transaction and decides commit vs rollback from the returned
//!   [`TxError`]. Hooks registered on the [`TxContext`] run after commit.
//! - **Idempotency**: [`IdempotencyStore`] persists a `Pending -> {Completed,
//!   Error}` record per key; [`idempotency::acquire`] turns the stored record into
//!   a [`Verdict`].
//! - **Schemas**: [`SchemaRegistry`] (content hash) and [`SubjectRegistry`]
//!   (numeric ids), with [`CachedRegistry`] in front.
//! - **Encoding**: [`ContentHashEncoder`], [`ConfluentEncoder`] and [`JsonEncoder`],
//!   plus a [`Decoder`] for both registry framings.
//! - **Dispatch**: [`QueuedEventSender`] (bounded queue, one worker, error topic),
//!   local senders for development, [`EventSenders`] fan-out, and the
//!   configuration string parsed by [`config::parse_senders`].
//!
//! Database and broker bindings live in `txkit-postgres` and `txkit-redpanda`;
//! the HTTP middleware lives in `txkit-web`.
//!
//! ## Example
//!
//! ```ignore
//! use txkit_core::{Envelope, TransactionRunner, TxError};
//!
//! let runner = TransactionRunner::new(database);
//!
//! runner
//!     .run_in_new(None, |tx| {
//!         Box::pin(async move {
//!             let order = insert_order(tx).await?;
//!             outbox.send_in_tx(tx, Envelope::new(OrderPlaced { id: order.id })).await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod encoder;
pub mod event;
pub mod idempotency;
pub mod local;
pub mod queued;
pub mod schema;
pub mod sender;
pub mod topics;
pub mod transaction;

pub use config::{ConfigError, SenderKind, SenderSpec, parse_senders};
pub use encoder::{ConfluentEncoder, ContentHashEncoder, Decoder, Encoder, JsonEncoder};
pub use event::{EncodeError, Envelope, Event, EventHeader, EventHeaders};
pub use idempotency::{
    CleanupTask, IdempotencyConfig, IdempotencyError, IdempotencyRecord, IdempotencyStatus,
    IdempotencyStore, StoredResponse, Verdict,
};
pub use local::{GzipEventSender, WriterEventSender};
pub use queued::QueuedEventSender;
pub use schema::{CachedRegistry, NoopRegistry, SchemaError, SchemaRegistry, SubjectRegistry};
pub use sender::{
    EventSender, EventSenders, NoopEventSender, OutboundMessage, Publisher, SenderError,
    TransactionalSender,
};
pub use topics::{ERROR_TOPIC, EventTopic, EventTopics, TopicsFn};
pub use transaction::{TransactionRunner, TxContext, TxError, TxHandle, TxStarter};

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock reading the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
