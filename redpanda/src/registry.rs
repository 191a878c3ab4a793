//! Schema registries reached over HTTP.

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use txkit_core::schema::content_hash;
use txkit_core::{SchemaError, SchemaRegistry, SubjectRegistry};

const CONSUL_PREFIX: &str = "avro-schemas/";
const CONFLUENT_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Timeout of the Confluent registry client.
pub const CONFLUENT_TIMEOUT: Duration = Duration::from_secs(3);

fn transport(err: reqwest::Error) -> SchemaError {
    SchemaError::Transport(err.to_string())
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

async fn rejected(response: Response) -> SchemaError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    SchemaError::Registry(format!("{status}: {body}"))
}

/// Content-addressed registry in Consul's KV store.
///
/// Schemas live under `avro-schemas/<content hash>`. `set` only writes keys
/// that do not exist yet.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    client: Client,
    base: String,
}

impl ConsulRegistry {
    /// Registry talking to the Consul agent at `address` (`host:port` or URL).
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Transport`] if the HTTP client cannot be built.
    pub fn new(address: &str) -> Result<Self, SchemaError> {
        let client = Client::builder().build().map_err(transport)?;
        Ok(Self::with_client(address, client))
    }

    /// Registry using an existing HTTP client.
    #[must_use]
    pub fn with_client(address: &str, client: Client) -> Self {
        Self {
            client,
            base: base_url(address),
        }
    }

    fn kv_url(&self, hash: &str) -> String {
        format!("{}/v1/kv/{CONSUL_PREFIX}{hash}", self.base)
    }

    async fn lookup(&self, hash: &str) -> Result<Option<String>, SchemaError> {
        let response = self
            .client
            .get(self.kv_url(hash))
            .query(&[("raw", "true")])
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await.map_err(transport)?)),
            _ => Err(rejected(response).await),
        }
    }
}

impl SchemaRegistry for ConsulRegistry {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        Box::pin(async move {
            self.lookup(key)
                .await?
                .ok_or_else(|| SchemaError::NotFound(key.to_string()))
        })
    }

    fn set<'a>(
        &'a self,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + 'a>> {
        Box::pin(async move {
            let hash = content_hash(schema);
            if self.lookup(&hash).await?.is_some() {
                return Ok(hash);
            }

            tracing::debug!(hash = %hash, "Writing schema to consul");
            let response = self
                .client
                .put(self.kv_url(&hash))
                .body(schema.to_string())
                .send()
                .await
                .map_err(transport)?;
            if !response.status().is_success() {
                return Err(rejected(response).await);
            }
            Ok(hash)
        })
    }
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: u32,
}

#[derive(Deserialize)]
struct SchemaResponse {
    schema: String,
}

/// Confluent-compatible schema registry (Confluent, Redpanda, Apicurio's
/// compatibility API).
///
/// The client times out after three seconds and accepts any TLS certificate.
#[derive(Debug, Clone)]
pub struct ConfluentRegistry {
    client: Client,
    base: String,
}

impl ConfluentRegistry {
    /// Registry at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Transport`] if the HTTP client cannot be built.
    pub fn new(address: &str) -> Result<Self, SchemaError> {
        let client = Client::builder()
            .timeout(CONFLUENT_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            base: base_url(address),
        })
    }
}

impl SubjectRegistry for ConfluentRegistry {
    fn register<'a>(
        &'a self,
        subject: &'a str,
        schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u32, SchemaError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/subjects/{subject}/versions", self.base))
                .header(reqwest::header::CONTENT_TYPE, CONFLUENT_CONTENT_TYPE)
                .json(&RegisterRequest { schema })
                .send()
                .await
                .map_err(transport)?;
            if !response.status().is_success() {
                return Err(rejected(response).await);
            }

            let registered: RegisterResponse = response.json().await.map_err(transport)?;
            tracing::debug!(subject, id = registered.id, "Schema registered");
            Ok(registered.id)
        })
    }

    fn schema_by_id(
        &self,
        id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + '_>> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/schemas/ids/{id}", self.base))
                .send()
                .await
                .map_err(transport)?;

            match response.status() {
                StatusCode::NOT_FOUND => Err(SchemaError::NotFound(format!("schema id {id}"))),
                status if status.is_success() => {
                    let found: SchemaResponse = response.json().await.map_err(transport)?;
                    Ok(found.schema)
                }
                _ => Err(rejected(response).await),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_adds_scheme() {
        assert_eq!(base_url("consul:8500"), "http://consul:8500");
        assert_eq!(base_url("https://registry.local/"), "https://registry.local");
    }

    #[test]
    fn test_consul_key_layout() {
        let registry = ConsulRegistry::new("localhost:8500").unwrap();
        assert_eq!(
            registry.kv_url("0123456789abcdef0123456789abcdef"),
            "http://localhost:8500/v1/kv/avro-schemas/0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn test_register_request_shape() {
        let body = serde_json::to_string(&RegisterRequest { schema: "\"long\"" }).unwrap();
        assert_eq!(body, r#"{"schema":"\"long\""}"#);
    }
}
