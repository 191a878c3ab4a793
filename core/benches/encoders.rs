//! Encoder benchmarks.
//!
//! Measures the per-event cost on the sender hot path once schemas are cached:
//! - content hash framing over a cached registry
//! - Confluent framing with a warm id cache
//! - plain JSON
//!
//! Run with: `cargo bench -p txkit-core`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use txkit_core::encoder::split_frame;
use txkit_core::schema::SchemaError;
use txkit_core::{
    CachedRegistry, ConfluentEncoder, ContentHashEncoder, Encoder, JsonEncoder, NoopRegistry,
    SubjectRegistry,
};

const SCHEMA: &str = r#"{
    "type": "record",
    "name": "OrderPlaced",
    "namespace": "bench.orders",
    "fields": [
        {"name": "id", "type": "long"},
        {"name": "customer", "type": "string"},
        {"name": "amount_cents", "type": "long"}
    ]
}"#;

#[derive(Serialize)]
struct OrderPlaced {
    id: i64,
    customer: String,
    amount_cents: i64,
}

txkit_core::avro_event!(OrderPlaced, SCHEMA);

struct FixedIds;

impl SubjectRegistry for FixedIds {
    fn register<'a>(
        &'a self,
        _subject: &'a str,
        _schema: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u32, SchemaError>> + Send + 'a>> {
        Box::pin(async { Ok(7) })
    }

    fn schema_by_id(
        &self,
        _id: u32,
    ) -> Pin<Box<dyn Future<Output = Result<String, SchemaError>> + Send + '_>> {
        Box::pin(async { Ok(SCHEMA.to_string()) })
    }
}

fn order() -> OrderPlaced {
    OrderPlaced {
        id: 42,
        customer: "customer-0042".to_string(),
        amount_cents: 12_999,
    }
}

fn bench_encoders(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let content_hash = ContentHashEncoder::new(CachedRegistry::new(NoopRegistry));
    let confluent = ConfluentEncoder::new(FixedIds);
    let event = order();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("content_hash", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(content_hash.encode(&event).await.expect("encode")) });
    });

    group.bench_function("confluent", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(confluent.encode(&event).await.expect("encode")) });
    });

    group.bench_function("json", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(JsonEncoder.encode(&event).await.expect("encode")) });
    });

    group.finish();
}

fn bench_frame_detection(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let framed = rt
        .block_on(ContentHashEncoder::new(NoopRegistry).encode(&order()))
        .expect("encode");

    c.bench_function("split_frame", |b| {
        b.iter(|| black_box(split_frame(black_box(&framed)).expect("frame")));
    });
}

criterion_group!(benches, bench_encoders, bench_frame_detection);
criterion_main!(benches);
