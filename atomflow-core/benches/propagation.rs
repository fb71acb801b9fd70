use std::sync::Arc;

use atomflow_core::reactive::{Atom, ManualDriver, Runtime};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn setup() -> (Arc<ManualDriver>, Runtime) {
    let driver = Arc::new(ManualDriver::new());
    let runtime = Runtime::new(driver.clone());
    (driver, runtime)
}

fn plus_one(rt: &Runtime, input: &Atom<u64>) -> Atom<u64> {
    let input = input.clone();
    rt.derived(move |get, _| Ok(get.get(&input)? + 1))
}

// ============================================================================
// Chains
// ============================================================================

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    for length in [10usize, 100, 1000] {
        let (driver, rt) = setup();
        let root = rt.source(0u64);
        let mut tail = root.as_atom().clone();
        for _ in 0..length {
            tail = plus_one(&rt, &tail);
            // Activate link by link instead of recursing from the tail.
            black_box(tail.get().ok());
        }
        let _sub = tail.subscribe(|_, _| {});
        driver.run_until_stalled();

        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            let mut next = 0u64;
            b.iter(|| {
                next += 1;
                root.set(next);
                driver.run_until_stalled();
                black_box(tail.get().ok());
            })
        });
    }
    group.finish();
}

// ============================================================================
// Fan-out and diamonds
// ============================================================================

fn bench_wide_diamond(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide_diamond");
    for width in [10usize, 100, 1000] {
        let (driver, rt) = setup();
        let root = rt.source(0u64);
        let sides: Vec<Atom<u64>> = (0..width).map(|_| plus_one(&rt, &root)).collect();
        let bottom = rt.collect(sides);
        let _sub = bottom.subscribe(|_, _| {});
        driver.run_until_stalled();

        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            let mut next = 0u64;
            b.iter(|| {
                next += 1;
                root.set(next);
                driver.run_until_stalled();
                black_box(bottom.get().ok());
            })
        });
    }
    group.finish();
}

// ============================================================================
// Activation and collection
// ============================================================================

fn bench_activate_collect(c: &mut Criterion) {
    let (driver, rt) = setup();
    let root = rt.source(1u64);
    let mut tail = root.as_atom().clone();
    for _ in 0..100 {
        tail = plus_one(&rt, &tail);
    }

    c.bench_function("activate_collect_100", |b| {
        b.iter(|| {
            let sub = tail.subscribe(|_, _| {});
            driver.run_until_stalled();
            sub.unsubscribe();
            black_box(driver.advance());
        })
    });
}

criterion_group!(benches, bench_chain, bench_wide_diamond, bench_activate_collect);
criterion_main!(benches);
