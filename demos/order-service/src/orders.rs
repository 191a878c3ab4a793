//! Order placement.

use axum::{Extension, Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use txkit_core::{
    Envelope, Event, EventSender, EventSenders, EventTopic, EventTopics, TopicsFn, TransactionalSender,
};
use txkit_postgres::{PgTransaction, PostgresOutbox};
use txkit_web::{AppError, RequestTx, WebResult};

const ORDER_PLACED_SCHEMA: &str = r#"{
    "type": "record",
    "name": "OrderPlaced",
    "namespace": "orders",
    "fields": [
        {"name": "id", "type": "long"},
        {"name": "customer", "type": "string"},
        {"name": "amount", "type": "long"}
    ]
}"#;

/// Orders table, created at startup.
pub const ORDERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS orders (
    id BIGSERIAL PRIMARY KEY,
    customer TEXT NOT NULL,
    amount BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)";

/// An order was placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// Order id
    pub id: i64,
    /// Customer name
    pub customer: String,
    /// Amount in cents
    pub amount: i64,
}

txkit_core::avro_event!(OrderPlaced, ORDER_PLACED_SCHEMA);

/// Topic routing for the service's events.
#[must_use]
pub fn topics() -> TopicsFn {
    Arc::new(|replication| {
        let sample: Arc<dyn Event> = Arc::new(OrderPlaced {
            id: 0,
            customer: String::new(),
            amount: 0,
        });
        EventTopics::new(EventTopic::new("order-events").replication(replication))
            .map_type::<OrderPlaced>(
                EventTopic::new("orders")
                    .partitions(6)
                    .replication(replication)
                    .config("retention.ms", "604800000"),
            )
            .schema_init_events(vec![sample])
    })
}

/// Handler dependencies.
#[derive(Clone)]
pub struct AppState {
    /// Transactional outbox
    pub outbox: Arc<PostgresOutbox>,
    /// Fire-and-forget senders, notified after commit
    pub senders: Arc<EventSenders>,
}

/// Request body of `POST /orders`.
#[derive(Debug, Deserialize)]
pub struct PlaceOrder {
    customer: String,
    amount: i64,
}

/// Response body of `POST /orders`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    order_id: String,
}

/// `POST /orders`
pub async fn place_order(
    State(state): State<AppState>,
    Extension(tx): Extension<RequestTx<PgTransaction>>,
    Json(request): Json<PlaceOrder>,
) -> WebResult<(StatusCode, Json<OrderCreated>)> {
    if request.amount <= 0 {
        return Err(AppError::validation("amount must be positive"));
    }

    let mut ctx = tx.lock().await;
    let (id,): (i64,) =
        sqlx::query_as("INSERT INTO orders (customer, amount) VALUES ($1, $2) RETURNING id")
            .bind(&request.customer)
            .bind(request.amount)
            .fetch_one(ctx.tx()?.conn())
            .await
            .map_err(|e| AppError::internal("could not store order").with_source(e))?;

    let event = OrderPlaced {
        id,
        customer: request.customer,
        amount: request.amount,
    };
    let key = id.to_string();
    state
        .outbox
        .send_in_tx(&mut ctx, Envelope::new(event.clone()).with_key(key.clone()))
        .await?;

    let senders = Arc::clone(&state.senders);
    ctx.on_commit(move || {
        tokio::spawn(async move {
            senders.send(Envelope::new(event).with_key(key)).await;
        });
    });

    tracing::info!(order_id = id, "Order placed");
    metrics::counter!("orders.placed").increment(1);
    Ok((
        StatusCode::CREATED,
        Json(OrderCreated {
            order_id: format!("o-{id}"),
        }),
    ))
}
