//! In-memory schema registries with call counters.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only poisoned locks panic

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use txkit_core::schema::content_hash;
use txkit_core::{SchemaError, SchemaRegistry, SubjectRegistry};

/// Content-addressed registry backed by a `HashMap`.
#[derive(Clone, Debug, Default)]
pub struct InMemorySchemaRegistry {
    schemas: Arc<RwLock<HashMap<String, String>>>,
    gets: Arc<AtomicUsize>,
    sets: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl InMemorySchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls that reached this registry.
    #[must_use]
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `set` calls that reached this registry.
    #[must_use]
    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    /// Number of stored schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.read().unwrap().len()
    }

    /// Whether no schema is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.read().unwrap().is_empty()
    }

    /// Fail every call with a transport error while `true`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SchemaError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchemaError::Transport("registry unavailable".to_string()));
        }
        Ok(())
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let result = self.check_available().and_then(|()| {
            self.schemas
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| SchemaError::NotFound(key.to_string()))
        });
        Box::pin(async move { result })
    }

    fn set<'a>(
        &'a self,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        let result = self.check_available().map(|()| {
            let key = content_hash(schema);
            self.schemas
                .write()
                .unwrap()
                .entry(key.clone())
                .or_insert_with(|| schema.to_string());
            key
        });
        Box::pin(async move { result })
    }
}

#[derive(Debug, Default)]
struct Subjects {
    ids: HashMap<String, u32>,
    schemas: HashMap<u32, String>,
    subjects: HashMap<String, Vec<u32>>,
}

/// Registry handing out sequential ids, like a Confluent registry would.
///
/// Identical schema text gets the same id regardless of subject.
#[derive(Clone, Debug, Default)]
pub struct InMemorySubjectRegistry {
    state: Arc<RwLock<Subjects>>,
    registrations: Arc<AtomicUsize>,
}

impl InMemorySubjectRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `register` calls.
    #[must_use]
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Ids registered under `subject`, oldest first.
    #[must_use]
    pub fn versions(&self, subject: &str) -> Vec<u32> {
        self.state
            .read()
            .unwrap()
            .subjects
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }
}

impl SubjectRegistry for InMemorySubjectRegistry {
    fn register<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u32, SchemaError>> + Send + 'a>> {
        self.registrations.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write().unwrap();
        let next = u32::try_from(state.ids.len() + 1).unwrap_or(u32::MAX);
        let id = *state.ids.entry(schema.to_string()).or_insert(next);
        state.schemas.entry(id).or_insert_with(|| schema.to_string());
        let versions = state.subjects.entry(subject.to_string()).or_default();
        if !versions.contains(&id) {
            versions.push(id);
        }
        drop(state);

        Box::pin(async move { Ok(id) })
    }

    fn schema_by_id(
        &self,
        id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + '_>> {
        let result = self
            .state
            .read()
            .unwrap()
            .schemas
            .get(&id)
            .cloned()
            .ok_or_else(|| SchemaError::NotFound(format!("schema id {id}")));
        Box::pin(async move { result })
    }
}
