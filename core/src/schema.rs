//! Schema registry abstraction.
//!
//! Two addressing schemes coexist:
//!
//! - [`SchemaRegistry`]: content addressed. The key is the MD5 hex digest of the
//!   schema text ([`content_hash`]), so the same schema always maps to the same key.
//! - [`SubjectRegistry`]: Confluent style. Schemas are registered under a subject
//!   and the registry hands out numeric ids.
//!
//! Entries are immutable once written. That is what makes [`CachedRegistry`]
//! safe without invalidation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Errors returned by schema registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// No schema stored under the key or id
    #[error("Schema not found: {0}")]
    NotFound(String),

    /// The registry rejected the request
    #[error("Registry error: {0}")]
    Registry(String),

    /// Network or transport error talking to the registry
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Content-addressed schema store.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so registries can be shared as
/// `Arc<dyn SchemaRegistry>`.
pub trait SchemaRegistry: Send + Sync {
    /// Fetch the schema text stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::NotFound`] if the key is unknown.
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>>;

    /// Store `schema` and return its key. Storing identical text twice returns
    /// the same key without error.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the backing store fails.
    fn set<'a>(
        &'a self,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>>;

    /// Release resources held by the registry.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if shutdown fails.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SchemaError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Registry handing out numeric ids per subject (Confluent wire format).
pub trait SubjectRegistry: Send + Sync {
    /// Register `schema` under `subject` and return its id. Registering the
    /// same schema again returns the existing id.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the registry rejects the schema.
    fn register<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u32, SchemaError>> + Send + 'a>>;

    /// Fetch the schema text for an id.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::NotFound`] if the id is unknown.
    fn schema_by_id(
        &self,
        id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + '_>>;
}

impl<R: SchemaRegistry + ?Sized> SchemaRegistry for Arc<R> {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        (**self).get(key)
    }

    fn set<'a>(
        &'a self,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        (**self).set(schema)
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SchemaError>> + Send + '_>> {
        (**self).close()
    }
}

impl<R: SubjectRegistry + ?Sized> SubjectRegistry for Arc<R> {
    fn register<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u32, SchemaError>> + Send + 'a>> {
        (**self).register(subject, schema)
    }

    fn schema_by_id(
        &self,
        id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + '_>> {
        (**self).schema_by_id(id)
    }
}

/// Deterministic key for a schema: lowercase MD5 hex digest, 32 characters.
#[must_use]
pub fn content_hash(schema: &str) -> String {
    format!("{:x}", md5::compute(schema.as_bytes()))
}

/// Whether `candidate` looks like a [`content_hash`] key.
#[must_use]
pub fn is_content_hash(candidate: &[u8]) -> bool {
    candidate.len() == 32
        && candidate
            .iter()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Caching decorator for any [`SchemaRegistry`].
///
/// `get` checks the cache before delegating. `set` hashes locally and only
/// delegates for unseen schemas, recording the entry once the backing registry
/// accepted it. Entries are never evicted.
pub struct CachedRegistry<R> {
    inner: R,
    cache: Mutex<HashMap<String, String>>,
}

impl<R: SchemaRegistry> CachedRegistry<R> {
    /// Wrap `inner` with an empty cache.
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached entries.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remember(&self, key: &str, schema: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_insert_with(|| schema.to_string());
    }
}

impl<R: SchemaRegistry> SchemaRegistry for CachedRegistry<R> {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(schema) = self.lookup(key) {
                return Ok(schema);
            }

            let schema = self.inner.get(key).await?;
            self.remember(key, &schema);
            Ok(schema)
        })
    }

    fn set<'a>(
        &'a self,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        Box::pin(async move {
            let key = content_hash(schema);
            if self.lookup(&key).is_some() {
                return Ok(key);
            }

            let key = self.inner.set(schema).await?;
            self.remember(&key, schema);
            Ok(key)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SchemaError>> + Send + '_>> {
        self.inner.close()
    }
}

/// Registry that stores nothing. `set` still returns the content hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRegistry;

impl SchemaRegistry for NoopRegistry {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        Box::pin(async move { Err(SchemaError::NotFound(key.to_string())) })
    }

    fn set<'a>(
        &'a self,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        Box::pin(async move { Ok(content_hash(schema)) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls so tests can see what reached the backing store.
    #[derive(Default)]
    struct CountingRegistry {
        entries: Mutex<HashMap<String, String>>,
        gets: AtomicUsize,
        sets: AtomicUsize,
        fail_sets: bool,
    }

    impl SchemaRegistry for CountingRegistry {
        fn get<'a>(
            &'a self,
            key: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
            Box::pin(async move {
                self.gets.fetch_add(1, Ordering::SeqCst);
                self.entries
                    .lock()
                    .unwrap()
                    .get(key)
                    .cloned()
                    .ok_or_else(|| SchemaError::NotFound(key.to_string()))
            })
        }

        fn set<'a>(
            &'a self,
            schema: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
            Box::pin(async move {
                self.sets.fetch_add(1, Ordering::SeqCst);
                if self.fail_sets {
                    return Err(SchemaError::Transport("registry down".to_string()));
                }
                let key = content_hash(schema);
                self.entries.lock().unwrap().insert(key.clone(), schema.to_string());
                Ok(key)
            })
        }
    }

    #[test]
    fn test_content_hash_is_md5_hex() {
        assert_eq!(content_hash(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert!(is_content_hash(content_hash("{\"type\":\"string\"}").as_bytes()));
        assert!(!is_content_hash(b"not-a-hash"));
        assert!(!is_content_hash(&[0u8; 32]));
        assert!(!is_content_hash(content_hash("x").to_uppercase().as_bytes()));
    }

    #[tokio::test]
    async fn test_set_is_idempotent_and_cached() {
        let registry = CachedRegistry::new(CountingRegistry::default());

        let first = registry.set("\"string\"").await.unwrap();
        let second = registry.set("\"string\"").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, content_hash("\"string\""));
        assert_eq!(registry.inner.sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_hits_cache_after_set() {
        let registry = CachedRegistry::new(CountingRegistry::default());

        let key = registry.set("\"long\"").await.unwrap();
        let schema = registry.get(&key).await.unwrap();

        assert_eq!(schema, "\"long\"");
        assert_eq!(registry.inner.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_populates_cache_from_backing_store() {
        let backing = CountingRegistry::default();
        let key = backing.set("\"int\"").await.unwrap();
        let registry = CachedRegistry::new(backing);

        registry.get(&key).await.unwrap();
        registry.get(&key).await.unwrap();

        assert_eq!(registry.inner.gets.load(Ordering::SeqCst), 1);
        assert_eq!(registry.cached(), 1);
    }

    #[tokio::test]
    async fn test_failed_set_is_not_cached() {
        let registry = CachedRegistry::new(CountingRegistry {
            fail_sets: true,
            ..CountingRegistry::default()
        });

        assert!(registry.set("\"bytes\"").await.is_err());
        assert!(registry.set("\"bytes\"").await.is_err());

        assert_eq!(registry.cached(), 0);
        assert_eq!(registry.inner.sets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let registry = CachedRegistry::new(NoopRegistry);
        let err = registry.get("missing").await.unwrap_err();
        assert_eq!(err, SchemaError::NotFound("missing".to_string()));
    }
}
