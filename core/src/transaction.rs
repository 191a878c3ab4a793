//! Transaction scoping with commit/rollback policy and post-commit hooks.
//!
//! A [`TransactionRunner`] owns a [`TxStarter`] (a connection pool in production,
//! an in-memory database in tests) and runs closures inside a [`TxContext`].
//! The closure's result decides what happens to the transaction:
//!
//! | closure result                 | transaction | returned to caller      |
//! |--------------------------------|-------------|-------------------------|
//! | `Ok(value)`                    | commit      | `Ok(value)`             |
//! | `Err(TxError::NotFound)`       | commit      | `Err(TxError::NotFound)`|
//! | `Err(TxError::NoRollback(e))`  | commit      | `Err(*e)`               |
//! | any other `Err(e)`             | rollback    | `Err(e)`                |
//!
//! Hooks registered with [`TxContext::on_commit`] run after a successful commit,
//! in registration order. They never run after a rollback, including the
//! rollback performed when the closure panics.
//!
//! # Example
//!
//! ```rust,ignore
//! let runner = TransactionRunner::new(database);
//!
//! let order_id = runner
//!     .run_in_new(None, |tx| {
//!         Box::pin(async move {
//!             let id = insert_order(tx).await?;
//!             tx.on_commit(move || tracing::info!(order_id = id, "order stored"));
//!             Ok(id)
//!         })
//!     })
//!     .await?;
//! ```

use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;

tokio::task_local! {
    static TOP_LEVEL_TX: ();
}

/// Errors produced by transaction scoping and by code running inside a transaction.
///
/// The runner decides between commit and rollback by matching on this enum.
#[derive(Error, Debug)]
pub enum TxError {
    /// A transaction is already attached to the calling context.
    #[error("transaction exists in context")]
    AlreadyActive,

    /// No transaction is attached to the calling context.
    #[error("no transaction in context")]
    NoTransaction,

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    Done,

    /// A lookup found nothing. Commits the transaction.
    #[error("not found")]
    NotFound,

    /// Wrapped error that still commits the transaction.
    #[error("{0}")]
    NoRollback(Box<TxError>),

    /// Database driver error.
    #[error("database error: {0}")]
    Database(String),

    /// Error raised by application code.
    #[error("{0}")]
    Application(Box<dyn std::error::Error + Send + Sync>),

    /// Rolling back after a failure failed as well.
    #[error("error during rollback: {rollback} due to error: {source}")]
    Rollback {
        /// The error that triggered the rollback
        source: Box<TxError>,
        /// The error returned by the rollback itself
        rollback: Box<TxError>,
    },

    /// The commit failed.
    #[error("error during commit: {commit}{}", original_suffix(.original))]
    Commit {
        /// The error returned by the commit
        commit: Box<TxError>,
        /// The error returned by the closure, if any
        original: Option<Box<TxError>>,
    },
}

fn original_suffix(original: &Option<Box<TxError>>) -> String {
    original
        .as_ref()
        .map(|err| format!(", original error was: {err}"))
        .unwrap_or_default()
}

impl TxError {
    /// Wrap an error so the transaction commits while the error is still returned.
    #[must_use]
    pub fn no_rollback(err: impl Into<Self>) -> Self {
        Self::NoRollback(Box::new(err.into()))
    }

    /// Wrap an application error.
    #[must_use]
    pub fn app(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Application(err.into())
    }

    /// Whether this error is (or wraps) the not-found sentinel.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::NoRollback(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// Whether returning this error from a closure rolls the transaction back.
    #[must_use]
    pub const fn requires_rollback(&self) -> bool {
        !matches!(self, Self::NotFound | Self::NoRollback(_))
    }
}

/// A live database transaction.
///
/// Implemented for the Postgres transaction type in `txkit-postgres` and for the
/// in-memory transaction in `txkit-testing`.
pub trait TxHandle: Send + 'static {
    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Database`] if the commit fails.
    fn commit(self) -> impl Future<Output = Result<(), TxError>> + Send;

    /// Roll back the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Database`] if the rollback fails.
    fn rollback(self) -> impl Future<Output = Result<(), TxError>> + Send;

    /// Commit the work done so far and continue in a fresh transaction on the
    /// same connection.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Database`] if the commit fails.
    fn commit_and_chain(&mut self) -> impl Future<Output = Result<(), TxError>> + Send;

    /// Create a savepoint.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Database`] if the savepoint cannot be created.
    fn savepoint(&mut self, name: &str) -> impl Future<Output = Result<(), TxError>> + Send;

    /// Undo everything done after the named savepoint.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Database`] if the savepoint is unknown.
    fn rollback_to_savepoint(
        &mut self,
        name: &str,
    ) -> impl Future<Output = Result<(), TxError>> + Send;
}

/// Opens transactions.
pub trait TxStarter: Send + Sync {
    /// The transaction type this starter produces.
    type Tx: TxHandle;

    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Database`] if no connection is available or `BEGIN` fails.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, TxError>> + Send;
}

type CommitHook = Box<dyn FnOnce() + Send>;

/// A live transaction together with its post-commit hooks.
///
/// Owned by the call chain that opened it. Pass `&mut TxContext` down the call
/// stack instead of sharing it between tasks.
pub struct TxContext<T> {
    tx: Option<T>,
    hooks: Vec<CommitHook>,
    // savepoint name and number of hooks registered before it
    savepoints: Vec<(String, usize)>,
}

impl<T> Default for TxContext<T> {
    /// An already finished context.
    fn default() -> Self {
        Self {
            tx: None,
            hooks: Vec::new(),
            savepoints: Vec::new(),
        }
    }
}

impl<T> std::fmt::Debug for TxContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxContext")
            .field("active", &self.tx.is_some())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl<T: TxHandle> TxContext<T> {
    /// Wrap a freshly opened transaction.
    #[must_use]
    pub fn new(tx: T) -> Self {
        Self {
            tx: Some(tx),
            hooks: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    /// Access the underlying transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Done`] after the transaction was rolled back or finished.
    pub fn tx(&mut self) -> Result<&mut T, TxError> {
        self.tx.as_mut().ok_or(TxError::Done)
    }

    /// Whether the transaction was already committed or rolled back.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.tx.is_none()
    }

    /// Number of hooks waiting for the next commit.
    #[must_use]
    pub fn pending_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Register an action to run after the transaction commits.
    ///
    /// Hooks must not touch the transaction.
    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Roll the transaction back now. Pending hooks are discarded.
    ///
    /// The runner treats a manually rolled back transaction as finished.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Done`] if already finished, or the rollback error.
    pub async fn rollback(&mut self) -> Result<(), TxError> {
        let tx = self.tx.take().ok_or(TxError::Done)?;
        self.hooks.clear();
        self.savepoints.clear();
        metrics::counter!("transaction.rolled_back").increment(1);
        tx.rollback().await
    }

    /// Commit and immediately continue in a new transaction, running the hooks
    /// registered so far.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Done`] if already finished, or the commit error.
    pub async fn commit_and_chain(&mut self) -> Result<(), TxError> {
        self.tx()?.commit_and_chain().await?;
        self.savepoints.clear();
        metrics::counter!("transaction.committed").increment(1);
        self.run_hooks();
        Ok(())
    }

    /// Create a savepoint inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Done`] if already finished, or the database error.
    pub async fn savepoint(&mut self, name: &str) -> Result<(), TxError> {
        self.tx()?.savepoint(name).await?;
        self.savepoints.push((name.to_string(), self.hooks.len()));
        Ok(())
    }

    /// Whether a savepoint with this name is still open.
    ///
    /// Committing (including [`commit_and_chain`](Self::commit_and_chain))
    /// releases all savepoints.
    #[must_use]
    pub fn has_savepoint(&self, name: &str) -> bool {
        self.savepoints.iter().any(|(n, _)| n == name)
    }

    /// Undo everything done after the named savepoint. Hooks registered after
    /// it are discarded; the savepoint itself stays usable.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Done`] if already finished, or the database error.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), TxError> {
        self.tx()?.rollback_to_savepoint(name).await?;
        if let Some(idx) = self.savepoints.iter().rposition(|(n, _)| n == name) {
            let hooks = self.savepoints[idx].1;
            self.savepoints.truncate(idx + 1);
            self.hooks.truncate(hooks);
        }
        Ok(())
    }

    /// Commit or roll back depending on `result`, then run hooks if committed.
    ///
    /// This is the decision step used by [`TransactionRunner::run_in_new`], exposed
    /// for callers that need to hold the context across a boundary a closure
    /// cannot span (for example an HTTP handler).
    ///
    /// # Errors
    ///
    /// Returns the closure error, or a composite [`TxError::Rollback`] /
    /// [`TxError::Commit`] when finishing the transaction failed too.
    pub async fn finish<R>(mut self, result: Result<R, TxError>) -> Result<R, TxError> {
        let Some(tx) = self.tx.take() else {
            // rolled back by the caller
            return result;
        };

        match result {
            Err(err) if err.requires_rollback() => {
                metrics::counter!("transaction.rolled_back").increment(1);
                match tx.rollback().await {
                    Ok(()) => Err(err),
                    Err(rollback) => Err(TxError::Rollback {
                        source: Box::new(err),
                        rollback: Box::new(rollback),
                    }),
                }
            }
            result => {
                let result = result.map_err(|err| match err {
                    TxError::NoRollback(inner) => *inner,
                    other => other,
                });

                match tx.commit().await {
                    Ok(()) => {
                        metrics::counter!("transaction.committed").increment(1);
                        self.run_hooks();
                        result
                    }
                    Err(commit) => Err(TxError::Commit {
                        commit: Box::new(commit),
                        original: result.err().map(Box::new),
                    }),
                }
            }
        }
    }

    fn run_hooks(&mut self) {
        for hook in self.hooks.drain(..) {
            hook();
        }
    }
}

/// Runs closures in new, existing or any transaction.
#[derive(Debug, Clone)]
pub struct TransactionRunner<S> {
    starter: S,
}

impl<S: TxStarter> TransactionRunner<S> {
    /// Create a runner that opens transactions through `starter`.
    #[must_use]
    pub const fn new(starter: S) -> Self {
        Self { starter }
    }

    /// The starter used for new transactions.
    #[must_use]
    pub const fn starter(&self) -> &S {
        &self.starter
    }

    /// Open a transaction and wrap it in a context, without running anything.
    ///
    /// Pair with [`TxContext::finish`].
    ///
    /// # Errors
    ///
    /// Returns [`TxError::AlreadyActive`] if `ambient` carries a transaction, or
    /// the error from beginning the transaction.
    pub async fn begin(
        &self,
        ambient: Option<&mut TxContext<S::Tx>>,
    ) -> Result<TxContext<S::Tx>, TxError> {
        if ambient.is_some_and(|ctx| !ctx.is_finished()) {
            return Err(TxError::AlreadyActive);
        }
        Ok(TxContext::new(self.starter.begin().await?))
    }

    /// Run `f` in a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::AlreadyActive`] if `ambient` already carries an active
    /// transaction. Otherwise returns the closure error or a composite error if
    /// the commit or rollback failed as well.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from `f` after rolling the transaction back.
    pub async fn run_in_new<R, F>(
        &self,
        ambient: Option<&mut TxContext<S::Tx>>,
        f: F,
    ) -> Result<R, TxError>
    where
        R: Send,
        F: for<'c> FnOnce(&'c mut TxContext<S::Tx>) -> BoxFuture<'c, Result<R, TxError>> + Send,
    {
        if ambient.is_some_and(|ctx| !ctx.is_finished()) {
            return Err(TxError::AlreadyActive);
        }

        let body = async move {
            let mut ctx = TxContext::new(self.starter.begin().await?);

            let outcome = AssertUnwindSafe(f(&mut ctx)).catch_unwind().await;
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => {
                    if let Some(tx) = ctx.tx.take() {
                        if let Err(err) = tx.rollback().await {
                            tracing::warn!(error = %err, "Rollback during panic failed");
                        }
                    }
                    std::panic::resume_unwind(panic);
                }
            };

            ctx.finish(result).await
        };

        if TOP_LEVEL_TX.try_with(|()| ()).is_ok() {
            tracing::warn!("Starting a new transaction while another one is open in the same task");
            body.await
        } else {
            TOP_LEVEL_TX.scope((), body).await
        }
    }

    /// Run `f` inside the transaction carried by `ambient`.
    ///
    /// An error that requires rollback rolls the existing transaction back. A
    /// failing rollback is logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::NoTransaction`] if `ambient` is `None` or already
    /// finished, otherwise the closure error.
    #[allow(clippy::unused_self)] // Uniform API with run_in_new / run_in_any
    pub async fn run_in_existing<R, F>(
        &self,
        ambient: Option<&mut TxContext<S::Tx>>,
        f: F,
    ) -> Result<R, TxError>
    where
        R: Send,
        F: for<'c> FnOnce(&'c mut TxContext<S::Tx>) -> BoxFuture<'c, Result<R, TxError>> + Send,
    {
        let Some(ctx) = ambient.filter(|ctx| !ctx.is_finished()) else {
            return Err(TxError::NoTransaction);
        };

        let result = f(&mut *ctx).await;
        match result {
            Err(err) if err.requires_rollback() => {
                if !ctx.is_finished() {
                    if let Err(rollback) = ctx.rollback().await {
                        tracing::warn!(
                            error = %err,
                            rollback_error = %rollback,
                            "Rollback of existing transaction failed"
                        );
                    }
                }
                Err(err)
            }
            Err(TxError::NoRollback(inner)) => Err(*inner),
            result => result,
        }
    }

    /// Run `f` in the ambient transaction if there is one, otherwise in a new one.
    ///
    /// # Errors
    ///
    /// See [`run_in_new`](Self::run_in_new) and [`run_in_existing`](Self::run_in_existing).
    pub async fn run_in_any<R, F>(
        &self,
        ambient: Option<&mut TxContext<S::Tx>>,
        f: F,
    ) -> Result<R, TxError>
    where
        R: Send,
        F: for<'c> FnOnce(&'c mut TxContext<S::Tx>) -> BoxFuture<'c, Result<R, TxError>> + Send,
    {
        match ambient {
            Some(ctx) if !ctx.is_finished() => self.run_in_existing(Some(ctx), f).await,
            _ => self.run_in_new(None, f).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_decision() {
        assert!(TxError::Database("boom".to_string()).requires_rollback());
        assert!(TxError::app("invalid order").requires_rollback());
        assert!(!TxError::NotFound.requires_rollback());
        assert!(!TxError::no_rollback(TxError::app("kept")).requires_rollback());
    }

    #[test]
    fn test_not_found_through_no_rollback() {
        assert!(TxError::no_rollback(TxError::NotFound).is_not_found());
        assert!(!TxError::AlreadyActive.is_not_found());
    }

    #[test]
    fn test_composite_messages_keep_both_errors() {
        let err = TxError::Rollback {
            source: Box::new(TxError::app("insert failed")),
            rollback: Box::new(TxError::Database("connection reset".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "error during rollback: database error: connection reset due to error: insert failed"
        );

        let err = TxError::Commit {
            commit: Box::new(TxError::Database("serialization failure".to_string())),
            original: Some(Box::new(TxError::app("kept going"))),
        };
        assert_eq!(
            err.to_string(),
            "error during commit: database error: serialization failure, original error was: kept going"
        );

        let err = TxError::Commit {
            commit: Box::new(TxError::Database("disk full".to_string())),
            original: None,
        };
        assert_eq!(err.to_string(), "error during commit: database error: disk full");
    }
}
