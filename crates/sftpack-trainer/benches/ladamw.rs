//! Benchmarks for the LAdamW update paths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use sftpack_core::Optimizer;
use sftpack_trainer::{LAdamWBuilder, ParameterSet};

fn params(n: usize) -> ParameterSet {
    ParameterSet::new()
        .with(
            "proj.weight",
            Array2::from_shape_fn((n, n), |(i, j)| ((i * 31 + j * 17) % 97) as f32 * 1e-3),
        )
        .unwrap()
}

fn grads(n: usize) -> Vec<Array2<f32>> {
    vec![Array2::from_shape_fn((n, n), |(i, j)| {
        (((i + 3 * j) % 13) as f32 - 6.0) * 1e-2
    })]
}

fn bench_update_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("ladamw_step");

    for n in [64, 256, 512] {
        for (label, fused) in [("fused", true), ("reference", false)] {
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, &n| {
                let set = params(n);
                let mut optimizer = LAdamWBuilder::new(1e-4)
                    .with_rank(16)
                    .with_reproject_interval(usize::MAX)
                    .with_fused(fused)
                    .build(&set)
                    .unwrap();
                let mut tensors = set.tensors().to_vec();
                let grads = grads(n);
                b.iter(|| {
                    optimizer
                        .step(black_box(&mut tensors), black_box(&grads))
                        .unwrap();
                });
            });
        }
    }

    group.finish();
}

fn bench_ranks(c: &mut Criterion) {
    let mut group = c.benchmark_group("ladamw_rank");
    let n = 256;

    for rank in [4, 16, 64] {
        group.bench_with_input(BenchmarkId::new("rank", rank), &rank, |b, &rank| {
            let set = params(n);
            let mut optimizer = LAdamWBuilder::new(1e-4)
                .with_rank(rank)
                .with_reproject_interval(usize::MAX)
                .build(&set)
                .unwrap();
            let mut tensors = set.tensors().to_vec();
            let grads = grads(n);
            b.iter(|| {
                optimizer
                    .step(black_box(&mut tensors), black_box(&grads))
                    .unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_update_paths, bench_ranks);
criterion_main!(benches);
