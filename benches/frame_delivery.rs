//! Frame delivery benchmark suite.
//!
//! Measures the delivery path against the in-process broker:
//! - Raw publish into subscribed topics: 1, 16, 64 topics
//! - Publish with a registered consumer (decode + forward)
//! - Image decode: rgb8 frames at 320x240 and 640x480
//!
//! Run with: cargo bench --bench frame_delivery
//! Results saved to: target/criterion/

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bridge_session::{
    BridgeSession, DecodedFrame, MemoryBroker, SessionConfig, TracingSink, decode,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::{Value, json};
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const TOPIC_COUNTS: &[usize] = &[1, 16, 64];
const IMAGE_SIZES: &[(u32, u32)] = &[(320, 240), (640, 480)];

// ============================================================================
// Setup
// ============================================================================

fn connected_session(rt: &Runtime, topics: usize) -> (MemoryBroker, BridgeSession) {
    let broker = MemoryBroker::new();
    let session = BridgeSession::new(
        SessionConfig::new(),
        Arc::new(broker.factory()),
        Arc::new(TracingSink),
    )
    .expect("session");

    rt.block_on(async {
        session.connect("localhost", 9090).await.expect("connect");
        for i in 0..topics {
            let name = format!("/topic_{i}");
            session
                .registry()
                .add_topic(&name, "std_msgs/String")
                .expect("add");
            session.registry().subscribe(&name).await.expect("subscribe");
        }
    });

    (broker, session)
}

fn rgb_frame(width: u32, height: u32) -> Value {
    let pixels = vec![0x7f_u8; (width * height * 3) as usize];
    json!({
        "width": width,
        "height": height,
        "encoding": "rgb8",
        "step": width * 3,
        "data": STANDARD.encode(pixels),
    })
}

// ============================================================================
// Benchmark: Publish
// ============================================================================

fn bench_publish(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");

    let mut group = c.benchmark_group("publish");
    for &count in TOPIC_COUNTS {
        let (broker, _session) = connected_session(&rt, count);
        let names: Vec<String> = (0..count).map(|i| format!("/topic_{i}")).collect();
        let payload = json!({"data": "hello"});

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("topics", count), &names, |b, names| {
            b.iter(|| {
                for name in names {
                    broker.publish(name, payload.clone());
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark: Publish With Consumer
// ============================================================================

fn bench_publish_with_consumer(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (broker, session) = connected_session(&rt, 1);
    session
        .registry()
        .set_consumer("/topic_0", |_topic: &str, frame: &DecodedFrame| {
            let _ = std::hint::black_box(frame);
        })
        .expect("consumer");

    c.bench_function("publish_with_consumer", |b| {
        b.to_async(&rt).iter(|| async {
            broker.publish("/topic_0", json!({"data": "hello"}));
            tokio::task::yield_now().await;
        });
    });
}

// ============================================================================
// Benchmark: Image Decode
// ============================================================================

fn bench_image_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_decode");
    group.sample_size(20);

    for &(width, height) in IMAGE_SIZES {
        let frame = rgb_frame(width, height);
        group.bench_with_input(
            BenchmarkId::new("rgb8", format!("{width}x{height}")),
            &frame,
            |b, frame| {
                b.iter(|| decode("sensor_msgs/Image", frame));
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_publish,
    bench_publish_with_consumer,
    bench_image_decode
);
criterion_main!(benches);
