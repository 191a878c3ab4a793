//! Idempotency middleware.
//!
//! Wraps state-changing routes so that a request carrying an
//! `Idempotency-Key` runs its handler at most once. The whole exchange runs
//! in one transaction:
//!
//! 1. Lock or create the idempotency record for the key.
//! 2. Replay a completed response, or reject a key that is still pending.
//! 3. Otherwise set a savepoint and call the handler. The handler joins the
//!    transaction through the [`RequestTx`] request extension.
//! 4. Capture the response. An error status undoes the handler's writes back
//!    to the savepoint, then the outcome is recorded and the transaction
//!    commits.
//!
//! The response is sent only after the commit, so a response the client saw
//! is always the one stored under its key.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Extension, Router, routing::post};
//! use txkit_web::{IdempotencyLayer, RequestTx};
//!
//! async fn place_order(Extension(tx): Extension<RequestTx<PgTransaction>>) -> StatusCode {
//!     let mut ctx = tx.lock().await;
//!     // ... write through ctx.tx() ...
//!     StatusCode::CREATED
//! }
//!
//! let app = Router::new()
//!     .route("/orders", post(place_order))
//!     .layer(IdempotencyLayer::new(store, TransactionRunner::new(database), clock, config));
//! ```

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Mutex, MutexGuard};
use tower::{Layer, Service, ServiceExt};
use tracing::Instrument;
use txkit_core::environment::Clock;
use txkit_core::idempotency::{acquire, decode_headers, encode_headers, record_outcome};
use txkit_core::{
    IdempotencyConfig, IdempotencyStore, StoredResponse, TransactionRunner, TxContext, TxError,
    TxHandle, TxStarter, Verdict,
};

use crate::error::AppError;

/// Request header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

const HANDLER_SAVEPOINT: &str = "idempotent_handler";

/// The request transaction, handed to handlers as a request extension.
///
/// Handlers lock it for the duration of their database work.
pub struct RequestTx<T>(Arc<Mutex<TxContext<T>>>);

impl<T> RequestTx<T> {
    /// Borrow the transaction context.
    pub async fn lock(&self) -> MutexGuard<'_, TxContext<T>> {
        self.0.lock().await
    }
}

impl<T> Clone for RequestTx<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> std::fmt::Debug for RequestTx<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RequestTx").finish_non_exhaustive()
    }
}

struct Shared<S, D> {
    store: Arc<S>,
    runner: TransactionRunner<D>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

/// Layer applying [`IdempotencyService`].
pub struct IdempotencyLayer<S, D> {
    shared: Arc<Shared<S, D>>,
}

impl<S, D> IdempotencyLayer<S, D>
where
    S: IdempotencyStore,
    D: TxStarter<Tx = S::Tx> + 'static,
{
    /// Keep records in `store`, opening transactions through `runner`.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        runner: TransactionRunner<D>,
        clock: Arc<dyn Clock>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                runner,
                clock,
                config,
            }),
        }
    }
}

impl<S, D> Clone for IdempotencyLayer<S, D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, D> std::fmt::Debug for IdempotencyLayer<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyLayer")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<Inner, S, D> Layer<Inner> for IdempotencyLayer<S, D> {
    type Service = IdempotencyService<Inner, S, D>;

    fn layer(&self, inner: Inner) -> Self::Service {
        IdempotencyService {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Middleware service enforcing idempotency keys.
pub struct IdempotencyService<Inner, S, D> {
    inner: Inner,
    shared: Arc<Shared<S, D>>,
}

impl<Inner: Clone, S, D> Clone for IdempotencyService<Inner, S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Inner, S, D> std::fmt::Debug for IdempotencyService<Inner, S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyService").finish_non_exhaustive()
    }
}

impl<Inner, S, D> Service<Request> for IdempotencyService<Inner, S, D>
where
    Inner: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: IdempotencyStore,
    D: TxStarter<Tx = S::Tx> + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // the ready service goes into the future, a fresh clone stays behind
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let shared = Arc::clone(&self.shared);

        Box::pin(async move {
            if !is_state_changing(req.method()) {
                return inner.oneshot(req).await;
            }

            let Some(key) = idempotency_key(&req) else {
                return Ok(AppError::bad_request("missing idempotency key").into_response());
            };

            let span = tracing::info_span!("idempotent_request", idempotency_key = %key);
            Ok(process(&shared, inner, req, key)
                .instrument(span)
                .await
                .unwrap_or_else(IntoResponse::into_response))
        })
    }
}

fn is_state_changing(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

fn idempotency_key(req: &Request) -> Option<String> {
    req.headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

async fn process<Inner, S, D>(
    shared: &Shared<S, D>,
    inner: Inner,
    mut req: Request,
    key: String,
) -> Result<Response, AppError>
where
    Inner: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
    Inner::Future: Send + 'static,
    S: IdempotencyStore,
    D: TxStarter<Tx = S::Tx> + 'static,
{
    let mut ctx = shared.runner.begin(None).await?;
    let now = shared.clock.now();

    let verdict = match acquire(&*shared.store, &mut ctx, &key, shared.config.stale_after, now).await {
        Ok(verdict) => verdict,
        Err(err) => {
            abort(ctx, err.to_string()).await;
            return Err(err.into());
        }
    };

    let retry = match verdict {
        Verdict::Replay(stored) => {
            ctx.finish(Ok(())).await?;
            metrics::counter!("idempotency.replayed").increment(1);
            tracing::debug!(idempotency_key = %key, status = stored.status_code, "Replaying stored response");
            return replay(&key, &stored);
        }
        Verdict::RetryLater => {
            ctx.finish(Ok(())).await?;
            metrics::counter!("idempotency.conflict", "kind" => "pending").increment(1);
            return Err(AppError::conflict(
                "request with this idempotency key is still pending, retry later",
            ));
        }
        Verdict::Stuck { age } => {
            ctx.finish(Ok(())).await?;
            metrics::counter!("idempotency.conflict", "kind" => "stuck").increment(1);
            tracing::error!(
                idempotency_key = %key,
                age_secs = age.as_secs(),
                "Idempotency key is stuck in pending"
            );
            return Err(AppError::internal("request with this idempotency key is stuck"));
        }
        Verdict::Execute { retry } => retry,
    };

    if retry {
        tracing::info!(idempotency_key = %key, "Retrying request after failed attempt");
    }
    ctx.savepoint(HANDLER_SAVEPOINT).await?;

    let request_tx = Arc::new(Mutex::new(ctx));
    req.extensions_mut().insert(RequestTx(Arc::clone(&request_tx)));

    let response = inner.oneshot(req).await.unwrap_or_else(|never| match never {});
    metrics::counter!("idempotency.executed").increment(1);

    // handlers may keep clones of the extension, take the context out
    let mut ctx = std::mem::take(&mut *request_tx.lock().await);
    if ctx.is_finished() {
        tracing::warn!(idempotency_key = %key, "Handler ended the request transaction, outcome not recorded");
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, shared.config.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(idempotency_key = %key, error = %err, "Response body could not be captured");
            abort(ctx, err.to_string()).await;
            return Err(AppError::internal("response could not be captured"));
        }
    };

    let stored = StoredResponse {
        status_code: parts.status.as_u16(),
        headers: encode_headers(
            parts
                .headers
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value))),
        )?,
        body: body.to_vec(),
    };

    if let Err(err) = record(shared, &mut ctx, &key, &stored).await {
        abort(ctx, err.to_string()).await;
        return Err(err);
    }
    ctx.finish(Ok(())).await?;

    Ok(Response::from_parts(parts, Body::from(body)))
}

async fn abort<T: TxHandle>(ctx: TxContext<T>, reason: String) {
    if let Err(TxError::Rollback { rollback, .. }) = ctx.finish::<()>(Err(TxError::app(reason))).await {
        tracing::warn!(error = %rollback, "Rolling back the request transaction failed");
    }
}

async fn record<S, D>(
    shared: &Shared<S, D>,
    ctx: &mut TxContext<S::Tx>,
    key: &str,
    stored: &StoredResponse,
) -> Result<(), AppError>
where
    S: IdempotencyStore,
{
    if stored.status_code >= 400 {
        if ctx.has_savepoint(HANDLER_SAVEPOINT) {
            ctx.rollback_to_savepoint(HANDLER_SAVEPOINT).await?;
            tracing::debug!(idempotency_key = key, status = stored.status_code, "Handler failed, work undone");
        } else {
            // the handler committed part of its work with commit_and_chain
            tracing::warn!(
                idempotency_key = key,
                status = stored.status_code,
                "Handler failed after committing, recording the error without undo"
            );
        }
    }
    record_outcome(&*shared.store, ctx, key, stored).await?;
    Ok(())
}

fn replay(key: &str, stored: &StoredResponse) -> Result<Response, AppError> {
    let status = StatusCode::from_u16(stored.status_code)
        .map_err(|e| AppError::internal("stored response is invalid").with_source(e))?;

    let mut response = Response::new(Body::from(stored.body.clone()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in decode_headers(&stored.headers)? {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::try_from(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    if let Ok(value) = HeaderValue::try_from(key) {
        headers.insert(IDEMPOTENCY_KEY_HEADER, value);
    }
    Ok(response)
}
