//! # txkit testing
//!
//! In-memory doubles for the txkit traits, so transactions, idempotency and
//! event dispatch can be tested without Postgres or a broker.
//!
//! This crate provides:
//! - [`InMemoryDatabase`]: transactional key-value store with row locks and savepoints
//! - [`InMemoryIdempotencyStore`]: idempotency records on top of it
//! - [`InMemoryOutbox`]: transactional sender writing into it
//! - [`InMemorySchemaRegistry`] / [`InMemorySubjectRegistry`]: registries with counters
//! - [`RecordingPublisher`]: captures published messages, can pause or fail
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use txkit_testing::{InMemoryDatabase, InMemoryIdempotencyStore, test_clock};
//!
//! #[tokio::test]
//! async fn test_replay() {
//!     let db = InMemoryDatabase::new();
//!     let store = InMemoryIdempotencyStore::new(db.clone(), Arc::new(test_clock()));
//!     // drive the middleware ...
//!     assert_eq!(db.commits(), 1);
//! }
//! ```

pub mod database;
pub mod fixtures;
pub mod idempotency;
pub mod outbox;
pub mod publisher;
pub mod registry;

/// Mock implementations of Environment traits
pub mod mocks {
    use chrono::{DateTime, Duration, Utc};
    use std::sync::{Mutex, PoisonError};
    use txkit_core::environment::Clock;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use txkit_testing::mocks::FixedClock;
    /// use txkit_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// 2025-01-01 00:00:00 UTC, the time [`test_clock`] reports.
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use database::{InMemoryDatabase, InMemoryTx};
pub use idempotency::InMemoryIdempotencyStore;
pub use mocks::{FixedClock, ManualClock, epoch, test_clock};
pub use outbox::{InMemoryOutbox, OutboxRow};
pub use publisher::RecordingPublisher;
pub use registry::{InMemorySchemaRegistry, InMemorySubjectRegistry};
