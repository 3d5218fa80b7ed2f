use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use client_queue::config::Config;
use client_queue::core::{
    ClientQueuePersistence, DiscardPolicy, InMemoryPayloadStore, LoggingDropService, Publish, Qos,
};

fn engine() -> (ClientQueuePersistence, Arc<InMemoryPayloadStore>) {
    let payloads = Arc::new(InMemoryPayloadStore::new());
    let engine = ClientQueuePersistence::in_memory(
        Config {
            bucket_count: 16,
            compaction_threshold: 1_000,
            ..Config::default()
        },
        Arc::clone(&payloads) as _,
        Arc::new(LoggingDropService::new()),
    )
    .unwrap();
    (engine, payloads)
}

fn create_publishes(payloads: &InMemoryPayloadStore, count: usize, qos: Qos) -> Vec<Publish> {
    (0..count)
        .map(|i| {
            let payload_id = payloads.add(vec![0u8; 256]);
            Publish::new(format!("bench/topic/{}", i % 16), qos, payload_id, format!("bench_pub_{i}"))
        })
        .collect()
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_queue_add");

    for &size in [100usize, 1_000].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("qos1", size), &size, |b, &size| {
            let (engine, payloads) = engine();
            let bucket = engine.bucket_for("bench-client");
            let publishes = create_publishes(&payloads, size, Qos::AtLeastOnce);

            b.iter(|| {
                for publish in &publishes {
                    engine
                        .add(
                            "bench-client",
                            false,
                            publish.clone().into(),
                            usize::MAX,
                            DiscardPolicy::Discard,
                            bucket,
                        )
                        .unwrap();
                }
                engine.clear("bench-client", false, bucket).unwrap();
                engine.clean_up(bucket).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_add_then_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_queue_read_new");
    let packet_ids: Vec<u16> = (1..=1_000).collect();

    for qos in [Qos::AtMostOnce, Qos::AtLeastOnce] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_function(BenchmarkId::new("add_read_remove", qos.number()), |b| {
            let (engine, payloads) = engine();
            let bucket = engine.bucket_for("bench-client");
            let publishes = create_publishes(&payloads, 1_000, qos);

            b.iter(|| {
                for publish in &publishes {
                    engine
                        .add(
                            "bench-client",
                            false,
                            publish.clone().into(),
                            usize::MAX,
                            DiscardPolicy::Discard,
                            bucket,
                        )
                        .unwrap();
                }
                let read = engine
                    .read_new("bench-client", false, &packet_ids, u64::MAX, bucket)
                    .unwrap();
                for message in &read {
                    if message.qos != Qos::AtMostOnce {
                        engine
                            .remove("bench-client", message.packet_id, None, bucket)
                            .unwrap();
                    }
                }
                black_box(read.len());
                engine.clean_up(bucket).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add, bench_add_then_read);
criterion_main!(benches);
