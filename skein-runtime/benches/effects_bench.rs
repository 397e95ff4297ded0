//! Effect runtime benchmarks using criterion.
//!
//! Benchmarks for interpreter throughput, fiber fork/join, scope finalization
//! and STM commits.
//!
//! Run with: cargo bench --bench effects_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skein_runtime::{Effect, ExecutionStrategy, Exit, Never, Runtime, RuntimeConfig, Scope, TxRef};

/// Benchmark the trampoline on long sequential chains
fn bench_interpreter(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter");
    let runtime = Runtime::current_thread();

    group.bench_function("succeed", |b| {
        b.iter(|| black_box(runtime.run_exit(Effect::<u64, Never>::succeed(1))));
    });

    for depth in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(depth));
        group.bench_with_input(
            BenchmarkId::new("flat_map_chain", depth),
            &depth,
            |b, &depth| {
                let program = (0..depth).fold(Effect::<u64, Never>::succeed(0), |acc, _| {
                    acc.flat_map(|n| Effect::succeed(n + 1))
                });
                b.iter(|| black_box(runtime.run_exit(program.clone())));
            },
        );
    }

    group.bench_function("catch_all_recover", |b| {
        let program = Effect::<u64, &str>::fail("boom").catch_all(|_| Effect::<u64, Never>::succeed(0));
        b.iter(|| black_box(runtime.run_exit(program.clone())));
    });

    group.finish();
}

/// Benchmark fiber creation and joining
fn bench_fibers(c: &mut Criterion) {
    let mut group = c.benchmark_group("fibers");
    let runtime = Runtime::current_thread();

    group.bench_function("fork_join", |b| {
        let program = Effect::<u64, Never>::succeed(1)
            .fork()
            .flat_map(|fiber| fiber.join());
        b.iter(|| black_box(runtime.run_exit(program.clone())));
    });

    for count in [10usize, 100] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("for_each_par", count),
            &count,
            |b, &count| {
                let program =
                    Effect::<(), Never>::for_each_par(0..count, |i| Effect::succeed(i));
                b.iter(|| black_box(runtime.run_exit(program.clone())));
            },
        );
    }

    let pool = Runtime::new(RuntimeConfig::builder().num_workers(4).build().unwrap());
    group.bench_function("pool_for_each_par_100", |b| {
        let program = Effect::<(), Never>::for_each_par(0..100, |i| Effect::succeed(i));
        b.iter(|| black_box(pool.run_exit(program.clone())));
    });
    pool.shutdown();

    group.finish();
}

/// Benchmark finalizer registration and release
fn bench_scope(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope");
    let runtime = Runtime::current_thread();

    for count in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("add_close", count),
            &count,
            |b, &count| {
                b.iter(|| {
                    let scope = Scope::new(ExecutionStrategy::Sequential);
                    for _ in 0..count {
                        runtime.run_exit(scope.add_finalizer(|_| Effect::unit()));
                    }
                    black_box(runtime.run_exit(scope.close(Exit::succeed(()))))
                });
            },
        );
    }

    group.finish();
}

/// Benchmark STM commit paths
fn bench_stm(c: &mut Criterion) {
    let mut group = c.benchmark_group("stm");
    let runtime = Runtime::current_thread();

    group.bench_function("single_update", |b| {
        let counter = TxRef::new(0u64);
        let program = counter.update(|n| n + 1);
        b.iter(|| black_box(runtime.run_exit(program.clone())));
    });

    for refs in [2usize, 8, 32] {
        group.throughput(Throughput::Elements(refs as u64));
        group.bench_with_input(
            BenchmarkId::new("multi_ref_commit", refs),
            &refs,
            |b, &refs| {
                let cells: Vec<TxRef<u64>> = (0..refs).map(|_| TxRef::new(0)).collect();
                let program = Effect::<(), Never>::for_each(cells, |cell| cell.update(|n| n + 1))
                    .atomically();
                b.iter(|| black_box(runtime.run_exit(program.clone())));
            },
        );
    }

    group.bench_function("contended_for_each_par_16", |b| {
        let counter = TxRef::new(0u64);
        let program = Effect::<(), Never>::for_each_par(0..16, {
            let counter = counter.clone();
            move |_| counter.update(|n| n + 1)
        });
        b.iter(|| black_box(runtime.run_exit(program.clone())));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_interpreter,
    bench_fibers,
    bench_scope,
    bench_stm,
);
criterion_main!(benches);
