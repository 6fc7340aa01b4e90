//! 🏎️ How fast can we pack records into batches? Spoiler: faster than Elasticsearch can eat them.
//!
//! Two questions, one bench file:
//! - `accumulate`: records through `add` + `flush` at a few batch sizes
//! - `content_hash`: the cost of deriving an id when the CSV has no id column

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ingx::accumulator::{Admission, BatchAccumulator};
use ingx::common::{Record, content_hash};

fn row(i: u64) -> Vec<(String, Option<String>)> {
    vec![
        ("id".to_string(), Some(format!("doc-{i}"))),
        ("name".to_string(), Some(format!("person number {i}"))),
        ("city".to_string(), Some("Oslo".to_string())),
        ("notes".to_string(), None),
    ]
}

fn records(n: u64) -> Vec<Record> {
    (1..=n).map(|i| Record::new(i, row(i), Some("id"))).collect()
}

fn bench_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate");
    let input = records(10_000);
    group.throughput(Throughput::Elements(input.len() as u64));

    for batch_size in [100usize, 500, 2_000] {
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &size| {
            b.iter(|| {
                let mut accumulator = BatchAccumulator::new(size, 5 * 1024 * 1024);
                let mut batches = 0usize;
                for record in input.iter().cloned() {
                    let mut pending = Some(record);
                    while let Some(record) = pending.take() {
                        if let Admission::BatchFull(bounced) = accumulator.add(record) {
                            batches += accumulator.flush().map_or(0, |_| 1);
                            pending = bounced;
                        }
                    }
                }
                batches += accumulator.flush().map_or(0, |_| 1);
                black_box(batches)
            });
        });
    }
    group.finish();
}

fn bench_content_hash(c: &mut Criterion) {
    let fields = row(42);
    c.bench_function("content_hash", |b| b.iter(|| content_hash(black_box(&fields))));
}

criterion_group!(benches, bench_accumulate, bench_content_hash);
criterion_main!(benches);
