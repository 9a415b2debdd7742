//! Performance benchmarks for the feed.

use chronicle_feed::{
    Broadcaster, ChangeEvent, FeedMessage, FileStore, FileStoreConfig, NewRecord, OperationKind,
    Record, Sequence,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

fn record(n: u64) -> Record {
    NewRecord::new("Admin", format!("post {}", n))
        .with_content("x".repeat(256))
        .into_record(Sequence(n))
        .unwrap()
}

/// Benchmark publish cost with varying subscriber counts
fn bench_publish_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fan_out");

    for subscribers in [1, 10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &count| {
                // Small queues so the drop-oldest path is exercised too.
                let broadcaster = Broadcaster::new(64);
                let subscriptions: Vec<_> = (0..count).map(|_| broadcaster.subscribe()).collect();
                let record = record(1);

                b.iter(|| {
                    broadcaster.publish(black_box(record.clone()));
                });

                black_box(subscriptions.len());
            },
        );
    }

    group.finish();
}

/// Benchmark durable inserts into a collection log
fn bench_oplog_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("oplog_insert");

    for sync_interval in [1u64, 100] {
        group.bench_with_input(
            BenchmarkId::new("sync_interval", sync_interval),
            &sync_interval,
            |b, &interval| {
                let dir = TempDir::new().unwrap();
                let store = FileStore::open_or_create(FileStoreConfig {
                    path: dir.path().join("store"),
                    create_if_missing: true,
                    sync_interval: interval,
                })
                .unwrap();
                let posts = store.collection("posts").unwrap();

                b.iter(|| {
                    posts
                        .insert(NewRecord::new("Admin", "bench").with_content("x".repeat(256)))
                        .unwrap()
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the wire encoding of a created-record message
fn bench_message_encoding(c: &mut Criterion) {
    let created = record(1);
    let event = ChangeEvent {
        sequence: Sequence(1),
        kind: OperationKind::Create,
        record_id: created.id.clone(),
        document: Some(created),
    };
    let message = FeedMessage::RecordCreated {
        record: event.into_created().unwrap(),
    };

    c.bench_function("feed_message_to_json", |b| {
        b.iter(|| black_box(message.to_json().unwrap()));
    });
}

criterion_group!(benches, bench_publish_fan_out, bench_oplog_insert, bench_message_encoding);
criterion_main!(benches);
