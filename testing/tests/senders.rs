//! Queued sender behaviour: ordering, backpressure, error rerouting and
//! draining on close. Also covers the transactional outbox.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use std::sync::Arc;
use std::time::Duration;
use txkit_core::encoder::split_frame;
use txkit_core::encoder::SchemaRef;
use txkit_core::queued::{ERROR_HEADER, EVENT_TYPE_HEADER};
use txkit_core::{
    ContentHashEncoder, Encoder, Envelope, Event, EventSender, EventSenders, EventTopic,
    EventTopics, JsonEncoder, NoopEventSender, QueuedEventSender, SenderError,
    TransactionRunner, TransactionalSender, TxError, ERROR_TOPIC,
};
use txkit_testing::fixtures::{Malformed, OrderCancelled, OrderPlaced};
use txkit_testing::{
    InMemoryDatabase, InMemoryOutbox, InMemorySchemaRegistry, RecordingPublisher,
};

fn topics() -> EventTopics {
    EventTopics::new(EventTopic::new("misc"))
        .map_type::<OrderPlaced>(EventTopic::new("orders").partitions(6).replication(3))
        .map_type::<OrderCancelled>(EventTopic::new("orders").partitions(6).replication(3))
}

async fn json_sender(publisher: &RecordingPublisher, buffer: usize) -> QueuedEventSender {
    QueuedEventSender::builder(Arc::new(JsonEncoder), Arc::new(publisher.clone()), topics())
        .buffer_size(buffer)
        .close_timeout(Duration::from_secs(2))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_build_creates_declared_and_error_topics() {
    let publisher = RecordingPublisher::new();
    let sender = json_sender(&publisher, 8).await;

    let created: Vec<_> = publisher.topics().into_iter().map(|t| (t.name, t.replication)).collect();
    assert_eq!(
        created,
        vec![
            ("misc".to_string(), 1),
            ("orders".to_string(), 3),
            (ERROR_TOPIC.to_string(), 3),
        ]
    );
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_events_are_published_in_order() {
    let publisher = RecordingPublisher::new();
    let sender = json_sender(&publisher, 64).await;

    for id in 0..20 {
        sender.send(Envelope::new(OrderPlaced::new(id)).with_key(id.to_string())).await;
    }
    sender.close().await.unwrap();

    let messages = publisher.messages_for("orders");
    assert_eq!(messages.len(), 20);
    for (id, message) in messages.iter().enumerate() {
        let event: OrderPlaced = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(event.id, i64::try_from(id).unwrap());
        assert_eq!(message.key.as_deref(), Some(id.to_string().as_str()));
    }
    assert_eq!(publisher.flushes(), 1);
}

#[tokio::test]
async fn test_unmapped_event_goes_to_fallback() {
    let publisher = RecordingPublisher::new();
    let sender = QueuedEventSender::builder(
        Arc::new(JsonEncoder),
        Arc::new(publisher.clone()),
        EventTopics::new(EventTopic::new("misc")),
    )
    .build()
    .await
    .unwrap();

    sender.send(Envelope::new(OrderPlaced::new(1))).await;
    sender.close().await.unwrap();

    assert_eq!(publisher.messages_for("misc").len(), 1);
}

#[tokio::test]
async fn test_full_queue_drops_event() {
    let publisher = RecordingPublisher::new();
    let sender = json_sender(&publisher, 2).await;
    let gate = publisher.pause().await;

    // no await point yields to the worker between these sends
    for id in 0..3 {
        sender.send(Envelope::new(OrderPlaced::new(id))).await;
    }
    assert_eq!(sender.dropped_events(), 1);

    drop(gate);
    sender.close().await.unwrap();

    let ids: Vec<i64> = publisher
        .messages_for("orders")
        .iter()
        .map(|m| serde_json::from_slice::<OrderPlaced>(&m.payload).unwrap().id)
        .collect();
    assert_eq!(ids, vec![0, 1]);
}

#[tokio::test]
async fn test_blocking_mode_waits_instead_of_dropping() {
    let publisher = RecordingPublisher::new();
    let sender = Arc::new(
        QueuedEventSender::builder(Arc::new(JsonEncoder), Arc::new(publisher.clone()), topics())
            .buffer_size(1)
            .blocking(true)
            .build()
            .await
            .unwrap(),
    );
    assert!(sender.is_blocking());
    let gate = publisher.pause().await;

    let producer = {
        let sender = Arc::clone(&sender);
        tokio::spawn(async move {
            for id in 0..5 {
                sender.send(Envelope::new(OrderPlaced::new(id))).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!producer.is_finished());

    drop(gate);
    producer.await.unwrap();
    sender.close().await.unwrap();

    assert_eq!(sender.dropped_events(), 0);
    assert_eq!(publisher.messages_for("orders").len(), 5);
}

#[tokio::test]
async fn test_encode_failure_is_rerouted_to_error_topic() {
    let publisher = RecordingPublisher::new();
    let registry = InMemorySchemaRegistry::new();
    let encoder = ContentHashEncoder::new(registry.clone());
    let sender = QueuedEventSender::builder(Arc::new(encoder), Arc::new(publisher.clone()), topics())
        .build()
        .await
        .unwrap();

    sender
        .send(Envelope::new(Malformed { id: "not-a-number".to_string() }).with_key("m-1"))
        .await;
    sender.send(Envelope::new(OrderPlaced::new(9))).await;
    sender.close().await.unwrap();

    let errors = publisher.messages_for(ERROR_TOPIC);
    assert_eq!(errors.len(), 1);
    let rerouted = &errors[0];
    assert_eq!(rerouted.key.as_deref(), Some("m-1"));
    let payload: serde_json::Value = serde_json::from_slice(&rerouted.payload).unwrap();
    assert_eq!(payload["id"], "not-a-number");

    let header = |name: &str| {
        rerouted
            .headers
            .iter()
            .find(|h| h.key == name)
            .map(|h| h.value.clone())
    };
    assert_eq!(header(EVENT_TYPE_HEADER).as_deref(), Some("Malformed"));
    assert!(header(ERROR_HEADER).is_some());

    let published = publisher.messages_for("orders");
    assert_eq!(published.len(), 1);
    let (schema, _) = split_frame(&published[0].payload).unwrap();
    assert!(matches!(schema, SchemaRef::Hash(_)));
    // the schema is stored before the payload fails to serialize
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_publish_failure_is_rerouted() {
    let publisher = RecordingPublisher::new();
    publisher.fail_topic("orders");
    let sender = json_sender(&publisher, 8).await;

    sender
        .send(Envelope::new(OrderCancelled { id: 4, reason: None }).with_header("trace", "t-1"))
        .await;
    sender.close().await.unwrap();

    let errors = publisher.messages_for(ERROR_TOPIC);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].headers[0].key, "trace");
    assert!(
        errors[0]
            .headers
            .iter()
            .any(|h| h.key == ERROR_HEADER && h.value.contains("rejected"))
    );
}

#[tokio::test]
async fn test_send_after_close_is_discarded() {
    let publisher = RecordingPublisher::new();
    let sender = json_sender(&publisher, 8).await;

    sender.close().await.unwrap();
    sender.send(Envelope::new(OrderPlaced::new(1))).await;
    sender.close().await.unwrap();

    assert!(publisher.messages().is_empty());
}

#[tokio::test]
async fn test_close_times_out_when_publisher_hangs() {
    let publisher = RecordingPublisher::new();
    let sender = QueuedEventSender::builder(Arc::new(JsonEncoder), Arc::new(publisher.clone()), topics())
        .close_timeout(Duration::from_millis(50))
        .build()
        .await
        .unwrap();
    let _gate = publisher.pause().await;

    sender.send(Envelope::new(OrderPlaced::new(1))).await;
    let err = sender.close().await.unwrap_err();

    assert!(matches!(err, SenderError::Timeout(_)));
}

#[tokio::test]
async fn test_send_sync_bypasses_queue() {
    let publisher = RecordingPublisher::new();
    let sender = json_sender(&publisher, 8).await;

    sender.send_sync(Envelope::new(OrderPlaced::new(3))).await.unwrap();
    assert_eq!(publisher.messages_for("orders").len(), 1);

    publisher.fail_topic("orders");
    let err = sender.send_sync(Envelope::new(OrderPlaced::new(4))).await.unwrap_err();
    assert!(matches!(err, SenderError::Publish(_)));
    assert!(publisher.messages_for(ERROR_TOPIC).is_empty());

    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_init_registers_schemas() {
    let publisher = RecordingPublisher::new();
    let registry = InMemorySchemaRegistry::new();
    let sender = QueuedEventSender::builder(
        Arc::new(ContentHashEncoder::new(registry.clone())),
        Arc::new(publisher),
        topics(),
    )
    .build()
    .await
    .unwrap();

    let events: Vec<Arc<dyn Event>> = vec![
        Arc::new(OrderPlaced::new(0)),
        Arc::new(OrderCancelled { id: 0, reason: None }),
    ];
    sender.init(&events).await.unwrap();
    assert_eq!(registry.len(), 2);

    registry.set_unavailable(true);
    let err = sender.init(&[Arc::new(Malformed { id: String::new() }) as Arc<dyn Event>]).await;
    assert!(err.is_err());

    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_zero_buffer_is_rejected() {
    let err = QueuedEventSender::builder(
        Arc::new(JsonEncoder),
        Arc::new(RecordingPublisher::new()),
        topics(),
    )
    .buffer_size(0)
    .build()
    .await
    .unwrap_err();

    assert!(matches!(err, SenderError::Config(_)));
}

#[tokio::test]
async fn test_fanout_reaches_every_sender() {
    let first = RecordingPublisher::new();
    let second = RecordingPublisher::new();
    let senders = EventSenders::new(vec![
        Arc::new(json_sender(&first, 8).await) as Arc<dyn EventSender>,
        Arc::new(NoopEventSender),
        Arc::new(json_sender(&second, 8).await),
    ]);
    assert_eq!(senders.len(), 3);

    senders.send(Envelope::new(OrderPlaced::new(1))).await;
    senders.close().await.unwrap();

    assert_eq!(first.messages().len(), 1);
    assert_eq!(second.messages().len(), 1);
}

#[tokio::test]
async fn test_outbox_rows_follow_the_transaction() {
    let db = InMemoryDatabase::new();
    let runner = TransactionRunner::new(db.clone());
    let encoder: Arc<dyn Encoder> = Arc::new(JsonEncoder);
    let outbox = Arc::new(InMemoryOutbox::new(encoder, topics()));

    let committed = Arc::clone(&outbox);
    runner
        .run_in_new(None, move |ctx| {
            Box::pin(async move {
                committed
                    .send_in_tx(ctx, Envelope::new(OrderPlaced::new(1)).with_key("1"))
                    .await?;
                Ok(())
            })
        })
        .await
        .unwrap();

    let aborted = Arc::clone(&outbox);
    let _ = runner
        .run_in_new(None, move |ctx| {
            Box::pin(async move {
                aborted.send_in_tx(ctx, Envelope::new(OrderPlaced::new(2))).await?;
                Err::<(), _>(TxError::app("payment failed"))
            })
        })
        .await;

    let rows = InMemoryOutbox::rows(&db);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].topic, "orders");
    assert_eq!(rows[0].key.as_deref(), Some("1"));
    let event: OrderPlaced = serde_json::from_slice(&rows[0].payload).unwrap();
    assert_eq!(event, OrderPlaced::new(1));
}
