//! Order service
//!
//! Places orders behind the idempotency middleware. Each order row and its
//! `OrderPlaced` outbox row are written in the request transaction; after
//! commit the event also goes to the configured event senders.
//!
//! # Usage
//!
//! ```bash
//! docker compose up -d
//! EVENT_SENDERS="stdout" cargo run -p order-service
//!
//! curl -X POST localhost:8080/orders \
//!     -H 'Idempotency-Key: abc-123' \
//!     -H 'Content-Type: application/json' \
//!     -d '{"customer":"alice","amount":10}'
//! ```

mod config;
mod orders;

use axum::{Router, routing::post};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use txkit_core::environment::{Clock, SystemClock};
use txkit_core::{CleanupTask, EventSender, JsonEncoder, TransactionRunner};
use txkit_postgres::{OutboxRelay, PgDatabase, PostgresIdempotencyStore, PostgresOutbox};
use txkit_redpanda::{KafkaPublisher, build_event_senders};
use txkit_web::IdempotencyLayer;

use crate::config::Config;
use crate::orders::{AppState, ORDERS_TABLE, place_order};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,order_service=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        listen = %config.listen_addr,
        senders = %config.event_senders,
        "Configuration loaded"
    );

    PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()?;

    let database = PgDatabase::connect(&config.database_url).await?;
    txkit_postgres::migrate(database.pool()).await?;
    sqlx::raw_sql(ORDERS_TABLE).execute(database.pool()).await?;

    let topics = orders::topics();
    let senders = Arc::new(build_event_senders(&config.event_senders, Arc::clone(&topics)).await?);
    let outbox = Arc::new(PostgresOutbox::new(Arc::new(JsonEncoder), topics(1)));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(PostgresIdempotencyStore::new(database.pool().clone()));
    let cleanup = CleanupTask::spawn(Arc::clone(&store), Arc::clone(&clock), &config.idempotency);

    let relay = match &config.outbox_brokers {
        Some(brokers) => {
            let publisher = Arc::new(KafkaPublisher::new(brokers)?);
            Some(OutboxRelay::new(database.pool().clone(), publisher).spawn())
        }
        None => None,
    };

    let app = Router::new()
        .route("/orders", post(place_order))
        .layer(IdempotencyLayer::new(
            store,
            TransactionRunner::new(database),
            clock,
            config.idempotency.clone(),
        ))
        .with_state(AppState {
            outbox,
            senders: Arc::clone(&senders),
        });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(address = %config.listen_addr, "Order service listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down");
    cleanup.stop().await;
    if let Some(relay) = relay {
        relay.stop().await;
    }
    senders.close().await?;
    Ok(())
}
