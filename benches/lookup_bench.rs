//! Lookup-or-insert benchmark.
//!
//! Simulates a training step's embedding fetch:
//!   - a cold pass where most keys are new and get claimed
//!   - warm passes where every key is already resident
//!
//! Workload parameters:
//!   - Batch size: keys per call
//!   - Distinct keys: size of the id space the batch is drawn from
//!   - Threads: workers in the launch grid

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::hint::black_box;
use std::time::Duration;

use embhash::{EmbeddingTable, Init, LaunchConfig, LookupRequest, lookup_or_insert};

const MEASURE_DURATION_SECS: u64 = 10;
const DIM: usize = 16;

struct LookupWorkload {
    keys: Vec<i64>,
    table_size: usize,
}

impl LookupWorkload {
    /// `distinct` ids, drawn with replacement; the table is sized for a
    /// load factor of one half.
    fn generate(batch: usize, distinct: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let keys = (0..batch)
            .map(|_| rng.random_range(0..distinct as i64))
            .collect();
        Self {
            keys,
            table_size: distinct * 2,
        }
    }
}

fn run(table: &EmbeddingTable<f32>, keys: &[i64], out: &mut [f32], launch: &LaunchConfig) {
    let request = LookupRequest::new(keys).with_init(Init::Uniform {
        low: -0.01,
        high: 0.01,
        seed: 7,
    });
    let stats = lookup_or_insert(table, &request, out, launch).expect("lookup");
    black_box(stats);
}

fn bench_cold_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_insert");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    for &batch in &[1_024, 16_384, 131_072] {
        let workload = LookupWorkload::generate(batch, batch, 42);
        let launch = LaunchConfig::with_threads(4);
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("f32", batch), &workload, |b, w| {
            let mut out = vec![0.0; w.keys.len() * DIM];
            b.iter_batched(
                || EmbeddingTable::<f32>::with_capacity(w.table_size, DIM).expect("table"),
                |table| run(&table, &w.keys, &mut out, &launch),
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_warm_lookup_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("warm_lookup_threads");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let batch = 65_536;
    let workload = LookupWorkload::generate(batch, 100_000, 42);
    let table = EmbeddingTable::<f32>::with_capacity(workload.table_size, DIM).expect("table");
    let mut out = vec![0.0; batch * DIM];
    run(&table, &workload.keys, &mut out, &LaunchConfig::with_threads(1));

    for &threads in &[1, 2, 4, 8] {
        let launch = LaunchConfig::with_threads(threads);
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &launch, |b, launch| {
            b.iter(|| run(&table, black_box(&workload.keys), &mut out, launch))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cold_insert, bench_warm_lookup_threads);
criterion_main!(benches);
