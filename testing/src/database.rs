//! In-memory transactional key-value database.
//!
//! Behaves like a tiny row store:
//! - writes are staged in the transaction and applied on commit
//! - [`InMemoryTx::lock`] takes a per-key lock held until commit or rollback,
//!   which is how `SELECT ... FOR UPDATE` is modelled
//! - savepoints snapshot the staged writes
//!
//! Counters and failure switches let tests observe and break commits.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only poisoned locks panic

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use txkit_core::{TxError, TxHandle, TxStarter};

type Rows = BTreeMap<String, Vec<u8>>;
type Staged = BTreeMap<String, Option<Vec<u8>>>;

#[derive(Default)]
struct Shared {
    rows: Mutex<Rows>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_next_commit: AtomicBool,
    fail_next_rollback: AtomicBool,
    fail_next_begin: AtomicBool,
}

impl Shared {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default(),
        )
    }
}

/// Shared in-memory database. Clones see the same data.
///
/// # Example
///
/// ```
/// use txkit_core::TransactionRunner;
/// use txkit_testing::InMemoryDatabase;
///
/// # async fn example() -> Result<(), txkit_core::TxError> {
/// let db = InMemoryDatabase::new();
/// let runner = TransactionRunner::new(db.clone());
///
/// runner
///     .run_in_new(None, |ctx| {
///         Box::pin(async move {
///             ctx.tx()?.put("order:1", b"placed".to_vec());
///             Ok(())
///         })
///     })
///     .await?;
///
/// assert_eq!(db.get("order:1"), Some(b"placed".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    shared: Arc<Shared>,
}

impl InMemoryDatabase {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.shared.rows.lock().unwrap().get(key).cloned()
    }

    /// Committed rows whose key starts with `prefix`.
    #[must_use]
    pub fn scan(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.shared
            .rows
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Write a committed row directly, outside any transaction.
    pub fn seed(&self, key: impl Into<String>, value: Vec<u8>) {
        self.shared.rows.lock().unwrap().insert(key.into(), value);
    }

    /// Number of transactions begun.
    #[must_use]
    pub fn begins(&self) -> usize {
        self.shared.begins.load(Ordering::SeqCst)
    }

    /// Number of successful commits (chained commits included).
    #[must_use]
    pub fn commits(&self) -> usize {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Number of rollbacks.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }

    /// Make the next commit fail. The transaction's writes are discarded.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next rollback report an error.
    pub fn fail_next_rollback(&self) {
        self.shared.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    /// Make the next `begin` fail.
    pub fn fail_next_begin(&self) {
        self.shared.fail_next_begin.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDatabase")
            .field("rows", &self.shared.rows.lock().unwrap().len())
            .field("commits", &self.commits())
            .field("rollbacks", &self.rollbacks())
            .finish()
    }
}

impl TxStarter for InMemoryDatabase {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, TxError> {
        if self.shared.fail_next_begin.swap(false, Ordering::SeqCst) {
            return Err(TxError::Database("connection refused".to_string()));
        }
        self.shared.begins.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryTx {
            shared: Arc::clone(&self.shared),
            staged: Staged::new(),
            savepoints: Vec::new(),
            held: HashMap::new(),
        })
    }
}

/// A transaction on an [`InMemoryDatabase`].
pub struct InMemoryTx {
    shared: Arc<Shared>,
    staged: Staged,
    savepoints: Vec<(String, Staged)>,
    held: HashMap<String, OwnedMutexGuard<()>>,
}

impl InMemoryTx {
    /// Lock `key` until the transaction ends. Waits while another transaction
    /// holds it. Locking a key twice is a no-op.
    pub async fn lock(&mut self, key: &str) {
        if self.held.contains_key(key) {
            return;
        }
        let guard = self.shared.lock_for(key).lock_owned().await;
        self.held.insert(key.to_string(), guard);
    }

    /// Whether this transaction holds the lock on `key`.
    #[must_use]
    pub fn holds_lock(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }

    /// Value of `key` as seen by this transaction.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.shared.rows.lock().unwrap().get(key).cloned(),
        }
    }

    /// Stage a write.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.staged.insert(key.into(), Some(value));
    }

    /// Stage a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.staged.insert(key.into(), None);
    }

    /// Lock `key` and write `value` unless it already exists. Returns whether
    /// the value was written.
    pub async fn insert_if_absent(&mut self, key: &str, value: Vec<u8>) -> bool {
        self.lock(key).await;
        if self.get(key).is_some() {
            return false;
        }
        self.put(key, value);
        true
    }

    /// Rows with `prefix` as seen by this transaction.
    #[must_use]
    pub fn scan(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let mut rows: Rows = self
            .shared
            .rows
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        for (key, staged) in self.staged.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match staged {
                Some(value) => rows.insert(key.clone(), value.clone()),
                None => rows.remove(key),
            };
        }
        rows.into_iter().collect()
    }

    fn apply(&mut self) {
        let mut rows = self.shared.rows.lock().unwrap();
        for (key, staged) in std::mem::take(&mut self.staged) {
            match staged {
                Some(value) => rows.insert(key, value),
                None => rows.remove(&key),
            };
        }
        self.savepoints.clear();
    }
}

impl std::fmt::Debug for InMemoryTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTx")
            .field("staged", &self.staged.len())
            .field("savepoints", &self.savepoints.len())
            .field("locks", &self.held.len())
            .finish()
    }
}

impl TxHandle for InMemoryTx {
    async fn commit(mut self) -> Result<(), TxError> {
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(TxError::Database("could not serialize access".to_string()));
        }
        self.apply();
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self) -> Result<(), TxError> {
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_next_rollback.swap(false, Ordering::SeqCst) {
            return Err(TxError::Database("connection reset".to_string()));
        }
        Ok(())
    }

    async fn commit_and_chain(&mut self) -> Result<(), TxError> {
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(TxError::Database("could not serialize access".to_string()));
        }
        self.apply();
        self.held.clear();
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), TxError> {
        self.savepoints.push((name.to_string(), self.staged.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), TxError> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(savepoint, _)| savepoint == name)
            .ok_or_else(|| TxError::Database(format!("savepoint \"{name}\" does not exist")))?;

        self.savepoints.truncate(position + 1);
        self.staged = self.savepoints[position].1.clone();
        Ok(())
    }
}
