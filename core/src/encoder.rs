//! Event encoders and the matching decoder.
//!
//! | encoder                | framing                                   | registry            |
//! |------------------------|-------------------------------------------|---------------------|
//! | [`ContentHashEncoder`] | 32 hex chars of the schema hash + datum   | [`SchemaRegistry`]  |
//! | [`ConfluentEncoder`]   | `0x00` + big-endian `u32` schema id + datum | [`SubjectRegistry`] |
//! | [`JsonEncoder`]        | plain JSON                                | none                |

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use crate::event::{EncodeError, Event, from_avro_datum};
use crate::schema::{SchemaRegistry, SubjectRegistry, is_content_hash};

/// Magic byte of the Confluent wire format.
pub const CONFLUENT_MAGIC: u8 = 0;

/// Length of the Confluent header (magic byte + schema id).
pub const CONFLUENT_HEADER_LEN: usize = 5;

/// Turns events into bytes.
pub trait Encoder: Send + Sync {
    /// Encode one event, registering its schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if serialization or schema registration fails.
    fn encode<'a>(
        &'a self,
        event: &'a dyn Event,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, EncodeError>> + Send + 'a>>;

    /// Release registry connections.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the registry fails to close.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EncodeError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

impl<E: Encoder + ?Sized> Encoder for Arc<E> {
    fn encode<'a>(
        &'a self,
        event: &'a dyn Event,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, EncodeError>> + Send + 'a>> {
        (**self).encode(event)
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EncodeError>> + Send + '_>> {
        (**self).close()
    }
}

/// Prefixes the Avro datum with the content hash of its schema.
pub struct ContentHashEncoder<R> {
    registry: R,
}

impl<R: SchemaRegistry> ContentHashEncoder<R> {
    /// Create an encoder storing schemas in `registry`.
    #[must_use]
    pub const fn new(registry: R) -> Self {
        Self { registry }
    }
}

impl<R: SchemaRegistry> Encoder for ContentHashEncoder<R> {
    fn encode<'a>(
        &'a self,
        event: &'a dyn Event,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, EncodeError>> + Send + 'a>> {
        Box::pin(async move {
            let key = self.registry.set(event.schema()).await?;
            let payload = event.to_avro_datum()?;

            let mut out = Vec::with_capacity(key.len() + payload.len());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&payload);
            Ok(out)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EncodeError>> + Send + '_>> {
        Box::pin(async move { Ok(self.registry.close().await?) })
    }
}

/// Encodes in the Confluent wire format.
///
/// Schema ids are cached per schema text, so each schema is registered once
/// per process.
pub struct ConfluentEncoder<R> {
    registry: R,
    ids: Mutex<HashMap<String, u32>>,
}

impl<R: SubjectRegistry> ConfluentEncoder<R> {
    /// Create an encoder registering schemas in `registry`.
    #[must_use]
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            ids: Mutex::new(HashMap::new()),
        }
    }

    async fn schema_id(&self, event: &dyn Event) -> Result<u32, EncodeError> {
        let cached = self
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.schema())
            .copied();
        if let Some(id) = cached {
            return Ok(id);
        }

        let subject = subject_name(event);
        tracing::debug!(subject = %subject, "Registering schema");
        let id = self.registry.register(&subject, event.schema()).await?;

        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.schema().to_string(), id);
        Ok(id)
    }
}

impl<R: SubjectRegistry> Encoder for ConfluentEncoder<R> {
    fn encode<'a>(
        &'a self,
        event: &'a dyn Event,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, EncodeError>> + Send + 'a>> {
        Box::pin(async move {
            let id = self.schema_id(event).await?;
            let payload = event.to_avro_datum()?;

            let mut out = Vec::with_capacity(CONFLUENT_HEADER_LEN + payload.len());
            out.push(CONFLUENT_MAGIC);
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&payload);
            Ok(out)
        })
    }
}

/// Subject a schema is registered under: the schema's `name`, else the event type.
#[must_use]
pub fn subject_name(event: &dyn Event) -> String {
    #[derive(serde::Deserialize)]
    struct Named {
        name: Option<String>,
    }

    serde_json::from_str::<Named>(event.schema())
        .ok()
        .and_then(|named| named.name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| event.event_type().to_string())
}

/// Plain JSON, no registry. Used by local senders and for the error topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode<'a>(
        &'a self,
        event: &'a dyn Event,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, EncodeError>> + Send + 'a>> {
        Box::pin(async move { event.to_json() })
    }
}

/// Schema address found in front of an encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaRef {
    /// Content hash written by [`ContentHashEncoder`]
    Hash(String),
    /// Registry id written by [`ConfluentEncoder`]
    Id(u32),
}

/// Split a Confluent-framed message into schema id and payload.
///
/// # Errors
///
/// Returns [`EncodeError::InvalidFormat`] for input shorter than five bytes or
/// with a non-zero magic byte.
pub fn parse_confluent_header(bytes: &[u8]) -> Result<(u32, &[u8]), EncodeError> {
    if bytes.len() < CONFLUENT_HEADER_LEN {
        return Err(EncodeError::InvalidFormat(format!(
            "expected at least {CONFLUENT_HEADER_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[0] != CONFLUENT_MAGIC {
        return Err(EncodeError::InvalidFormat(format!(
            "unexpected magic byte {:#04x}",
            bytes[0]
        )));
    }

    let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((id, &bytes[CONFLUENT_HEADER_LEN..]))
}

/// Detect the framing of an encoded message.
///
/// # Errors
///
/// Returns [`EncodeError::InvalidFormat`] if neither framing matches.
pub fn split_frame(bytes: &[u8]) -> Result<(SchemaRef, &[u8]), EncodeError> {
    if bytes.starts_with(b"Obj\x01") {
        return Err(EncodeError::InvalidFormat(
            "avro container files are not supported".to_string(),
        ));
    }

    if bytes.len() >= 32 && is_content_hash(&bytes[..32]) {
        let hash = String::from_utf8_lossy(&bytes[..32]).into_owned();
        return Ok((SchemaRef::Hash(hash), &bytes[32..]));
    }

    let (id, payload) = parse_confluent_header(bytes)?;
    Ok((SchemaRef::Id(id), payload))
}

/// Decodes messages written by either registry encoder.
#[derive(Default, Clone)]
pub struct Decoder {
    hashes: Option<Arc<dyn SchemaRegistry>>,
    ids: Option<Arc<dyn SubjectRegistry>>,
}

impl Decoder {
    /// Create a decoder without registries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve content-hash framed messages through `registry`.
    #[must_use]
    pub fn with_schema_registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.hashes = Some(registry);
        self
    }

    /// Resolve Confluent framed messages through `registry`.
    #[must_use]
    pub fn with_subject_registry(mut self, registry: Arc<dyn SubjectRegistry>) -> Self {
        self.ids = Some(registry);
        self
    }

    /// Look up the writer schema and return it with the raw datum.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the framing is unknown, no registry is
    /// configured for it, or the schema lookup fails.
    pub async fn writer_schema<'b>(&self, bytes: &'b [u8]) -> Result<(String, &'b [u8]), EncodeError> {
        let (schema_ref, payload) = split_frame(bytes)?;
        let schema = match (&schema_ref, &self.hashes, &self.ids) {
            (SchemaRef::Hash(hash), Some(registry), _) => registry.get(hash).await?,
            (SchemaRef::Id(id), _, Some(registry)) => registry.schema_by_id(*id).await?,
            _ => {
                return Err(EncodeError::InvalidFormat(format!(
                    "no registry configured for {schema_ref:?}"
                )));
            }
        };
        Ok((schema, payload))
    }

    /// Decode a framed message into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the schema cannot be resolved or the payload
    /// does not decode into `T`.
    pub async fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, EncodeError> {
        let (schema, payload) = self.writer_schema(bytes).await?;
        from_avro_datum(&schema, payload)
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("schema_registry", &self.hashes.is_some())
            .field("subject_registry", &self.ids.is_some())
            .finish()
    }
}
