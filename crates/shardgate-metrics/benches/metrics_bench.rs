// Criterion benchmarks for shardgate-metrics
//
// Run benchmarks with:
//   cargo bench -p shardgate-metrics

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardgate_metrics::{MetricsCollector, RouterMetricsCollector};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn bench_record_call(c: &mut Criterion) {
    let collector = RouterMetricsCollector::new();

    c.bench_function("record_call", |b| {
        b.iter(|| collector.record_call(black_box("query"), black_box(Instant::now()), true));
    });
}

fn bench_record_shard_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_shard_request");

    for shard_count in [1usize, 8, 64] {
        let collector = RouterMetricsCollector::new();
        let shards: Vec<String> = (0..shard_count).map(|i| format!("shard{}", i)).collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(shard_count),
            &shards,
            |b, shards| {
                b.iter(|| {
                    for shard in shards {
                        collector.record_shard_request(black_box(shard));
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let collector = RouterMetricsCollector::new();
    for (i, op) in ["query", "getmore", "command", "insert", "update", "delete"]
        .iter()
        .cycle()
        .take(600)
        .enumerate()
    {
        collector.record_call(op, Instant::now(), i % 7 != 0);
        collector.record_shard_request(&format!("shard{}", i % 16));
    }

    c.bench_function("snapshot", |b| b.iter(|| collector.snapshot()));
}

fn bench_concurrent_record(c: &mut Criterion) {
    c.bench_function("concurrent_record_4_threads", |b| {
        b.iter(|| {
            let collector = Arc::new(RouterMetricsCollector::new());
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let collector = Arc::clone(&collector);
                    thread::spawn(move || {
                        for _ in 0..250 {
                            collector.record_call("query", Instant::now(), true);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_record_call,
    bench_record_shard_request,
    bench_snapshot,
    bench_concurrent_record
);
criterion_main!(benches);
