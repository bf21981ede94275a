//! Fairness Benchmarks
//!
//! Run: cargo bench --bench fairness
//!
//! Measures the per-round cost of seed generation, crash point derivation
//! and reveal verification.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use crash_round::fairness::{
    commit_hex, derive, proof, verify, verify_reveal, DeterministicEntropy, FairnessEngine, Seed,
};

fn bench_derive(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive");
    let seed = Seed::new([0x5a; 32]);

    group.bench_function("single_round", |b| {
        let mut round_id = 0u64;
        b.iter(|| {
            round_id += 1;
            black_box(derive(black_box(&seed), round_id))
        });
    });

    group.throughput(Throughput::Elements(1000));
    group.bench_function("1000_rounds", |b| {
        b.iter(|| {
            for round_id in 0..1000u64 {
                black_box(derive(&seed, round_id));
            }
        });
    });

    group.finish();
}

fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate");

    group.bench_function("deterministic_entropy", |b| {
        let mut engine = FairnessEngine::new(Arc::new(DeterministicEntropy::new(1)));
        let mut round_id = 0u64;
        b.iter(|| {
            round_id += 1;
            black_box(engine.generate(round_id))
        });
    });

    group.bench_function("os_entropy", |b| {
        let mut engine = FairnessEngine::with_os_entropy();
        let mut round_id = 0u64;
        b.iter(|| {
            round_id += 1;
            black_box(engine.generate(round_id))
        });
    });

    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify");

    for round_id in [1u64, 1_000_000] {
        let seed = Seed::new([0x3c; 32]);
        let seed_hex = seed.to_hex();
        let commit_hash = commit_hex(&seed, round_id);
        let (_, crash_point) = derive(&seed, round_id);

        group.bench_with_input(BenchmarkId::new("verify", round_id), &round_id, |b, &id| {
            b.iter(|| black_box(verify(&seed_hex, id, crash_point.to_f64())));
        });
        group.bench_with_input(BenchmarkId::new("verify_reveal", round_id), &round_id, |b, &id| {
            b.iter(|| black_box(verify_reveal(&seed_hex, id, &commit_hash, crash_point)));
        });
        group.bench_with_input(BenchmarkId::new("proof", round_id), &round_id, |b, &id| {
            b.iter(|| black_box(proof(&seed, id)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_derive, bench_generate, bench_verify);
criterion_main!(benches);
