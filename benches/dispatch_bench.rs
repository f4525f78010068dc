//! Benchmarks for the latency-aware upstream ranking used by the
//! dispatcher.
//!
//! Measures how quickly a performance record can absorb a new sample and
//! recompute its estimated delay once the ring buffer is full and the
//! least-squares slope kicks in.

use criterion::{black_box, BenchmarkId, Criterion, Throughput};

use dnsrelay::dispatcher::record_latency_sample_for_bench;

fn bench_record_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("performance_record");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("record_latency", "steady_state"), |b| {
        b.iter(|| record_latency_sample_for_bench(black_box(12)))
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_record_latency(&mut criterion);
    criterion.final_summary();
}
