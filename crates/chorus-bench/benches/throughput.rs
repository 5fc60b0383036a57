//! Throughput benchmarks for the realtime transport and message delivery.

use chorus_bench::{online_group, transport_with_devices, transport_with_room};
use chorus_core::{MessageDraft, UserId};
use chorus_protocol::EventName;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

/// Benchmark publishing one event to a room of growing size.
fn bench_room_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_publish");
    let payload = json!({ "conversation_id": "bench", "user": "user-0" });

    for size in [1, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let transport = transport_with_room("conversation:bench", size);
            b.iter(|| {
                transport.publish(
                    black_box("conversation:bench"),
                    EventName::Typing,
                    payload.clone(),
                )
            });
        });
    }

    group.finish();
}

/// Benchmark per-user push to a user on many devices.
fn bench_user_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("user_publish");
    let user = UserId::from("alice");
    let payload = json!({ "user": "bob", "online": true });

    for devices in [1, 5, 50].iter() {
        group.throughput(Throughput::Elements(*devices as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(devices),
            devices,
            |b, &devices| {
                let transport = transport_with_devices(&user, devices);
                b.iter(|| {
                    transport.publish_to_user(
                        black_box(&user),
                        EventName::UserStatusChange,
                        payload.clone(),
                    )
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the full send path into an online group.
fn bench_group_send(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("group_send");

    for members in [2, 20, 200].iter() {
        let (hub, conversation, sender) = rt.block_on(online_group(*members));
        group.throughput(Throughput::Elements(*members as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), members, |b, _| {
            b.to_async(&rt).iter(|| async {
                hub.messages()
                    .send(conversation, &sender, MessageDraft::text("benchmark message"))
                    .await
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_room_publish,
    bench_user_publish,
    bench_group_send,
);
criterion_main!(benches);
