//! Axum integration for txkit.
//!
//! [`IdempotencyLayer`] makes `POST`, `PUT` and `PATCH` routes safe to retry:
//! each request must carry an `Idempotency-Key`, the handler runs at most
//! once per key, and retries receive the stored response.
//!
//! # Request Flow
//!
//! 1. The layer opens a transaction and locks the key's record
//! 2. A completed record is replayed without calling the handler
//! 3. Otherwise the handler runs, joining the transaction via [`RequestTx`]
//! 4. The captured response is stored and the transaction commits
//! 5. The response is returned to the client
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::post};
//! use txkit_web::IdempotencyLayer;
//!
//! let app = Router::new()
//!     .route("/orders", post(place_order))
//!     .layer(IdempotencyLayer::new(
//!         Arc::new(PostgresIdempotencyStore::new(pool.clone())),
//!         TransactionRunner::new(PgDatabase::from_pool(pool)),
//!         Arc::new(SystemClock),
//!         IdempotencyConfig::default(),
//!     ));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod idempotency;

pub use error::AppError;
pub use idempotency::{IDEMPOTENCY_KEY_HEADER, IdempotencyLayer, IdempotencyService, RequestTx};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
