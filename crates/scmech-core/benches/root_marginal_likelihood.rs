//! Benchmarks for the conjugate root node's closed-form scores.
//!
//! Run with: `cargo bench --bench root_marginal_likelihood`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nalgebra::{DMatrix, DVector};
use scmech_core::{ConjugateGaussianRoot, GaussianRootConfig, Mechanism, Mode};

fn make_targets(len: usize, seed: u64) -> DVector<f64> {
    let mut state = seed;
    DVector::from_fn(len, |_, _| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((state >> 11) as f64) / ((u64::MAX >> 11) as f64) * 2.0 - 1.0
    })
}

fn bench_root_mll(c: &mut Criterion) {
    let mut group = c.benchmark_group("root_log_marginal_likelihood");
    for size in [16_usize, 256, 4096] {
        let mut root = ConjugateGaussianRoot::new(GaussianRootConfig {
            seed: Some(1),
            ..Default::default()
        })
        .unwrap();
        root.set_data(&[make_targets(size, 1)]).unwrap();

        let inputs: Vec<DMatrix<f64>> = (0..8).map(|_| DMatrix::zeros(size, 0)).collect();
        let targets: Vec<DVector<f64>> = (0..8).map(|b| make_targets(size, b + 2)).collect();
        group.throughput(Throughput::Elements((8 * size) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                black_box(
                    root.total_log_marginal_likelihood(
                        black_box(&inputs),
                        black_box(&targets),
                        Mode::Posterior,
                    )
                    .unwrap(),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_root_mll);
criterion_main!(benches);
