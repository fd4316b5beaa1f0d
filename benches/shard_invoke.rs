//! Benchmarks for cross-shard invocation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shard_seckill::prelude::*;
use std::cell::Cell;

struct Counter {
    hits: Cell<u64>,
}

impl Service for Counter {}

fn bench_submit_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_round_trip");
    let smp = Smp::new(SmpConfig::new().with_num_shards(2)).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("wait", |b| {
        b.iter(|| smp.submit_to(1, || black_box(42u64)).wait().unwrap());
    });

    group.finish();
    smp.shutdown();
}

fn bench_pipelined_invoke(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipelined_invoke");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let smp = Smp::new(SmpConfig::new().with_num_shards(2)).unwrap();
            let mut dir = Directory::new(&smp);
            dir.start(|_| Ok(Counter { hits: Cell::new(0) })).unwrap();

            b.iter(|| {
                let futures: Vec<_> = (0..size)
                    .map(|_| dir.invoke_on(1, |c| c.hits.set(c.hits.get() + 1)))
                    .collect();
                for future in futures {
                    black_box(future.wait().unwrap());
                }
            });

            dir.stop().unwrap();
            smp.shutdown();
        });
    }

    group.finish();
}

fn bench_map_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_reduce");

    for num_shards in [2, 4, 8].iter() {
        group.throughput(Throughput::Elements(*num_shards as u64));

        group.bench_with_input(
            BenchmarkId::from_parameter(num_shards),
            num_shards,
            |b, &num_shards| {
                let smp = Smp::new(SmpConfig::new().with_num_shards(num_shards)).unwrap();
                let mut dir = Directory::new(&smp);
                dir.start(|_| Ok(Counter { hits: Cell::new(1) })).unwrap();

                b.iter(|| {
                    let total = dir.map_reduce(|c| c.hits.get(), 0u64, |acc, h| acc + h).unwrap();
                    black_box(total)
                });

                dir.stop().unwrap();
                smp.shutdown();
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_submit_round_trip, bench_pipelined_invoke, bench_map_reduce);

criterion_main!(benches);
