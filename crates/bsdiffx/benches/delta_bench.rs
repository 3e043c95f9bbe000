//! Delta codec and merge benchmarks

use bsdiffx::{diff, merge_patches, patch, CompressionMode};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Three generations of a buffer with scattered edits
fn generations(size: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut rng = StdRng::seed_from_u64(size as u64);
    let a: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
    let mut b = a.clone();
    for _ in 0..size / 256 {
        let at = rng.gen_range(0..b.len());
        b[at] = rng.gen();
    }
    let mut c = b.clone();
    for _ in 0..size / 256 {
        let at = rng.gen_range(0..c.len());
        c[at] = rng.gen();
    }
    c.extend((0..size / 16).map(|_| rng.gen::<u8>()));
    (a, b, c)
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    for size in [16 * 1024, 256 * 1024] {
        let (a, b, _) = generations(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| diff(black_box(&a), black_box(&b), CompressionMode::Zstd))
        });
    }
    group.finish();
}

fn bench_patch(c: &mut Criterion) {
    let mut group = c.benchmark_group("patch");
    for size in [16 * 1024, 256 * 1024] {
        let (a, b, _) = generations(size);
        let Ok(delta) = diff(&a, &b, CompressionMode::Zstd) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| patch(black_box(&a), black_box(&delta)))
        });
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    for size in [16 * 1024, 256 * 1024] {
        let (a, b, c_gen) = generations(size);
        let (Ok(lower), Ok(upper)) = (
            diff(&a, &b, CompressionMode::Zstd),
            diff(&b, &c_gen, CompressionMode::Zstd),
        ) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| merge_patches(black_box(&lower), black_box(&upper)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_diff, bench_patch, bench_merge);
criterion_main!(benches);
