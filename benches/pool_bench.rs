use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use weft::PoolBuilder;

fn dispatch_round_trip(c: &mut Criterion) {
    let pool = PoolBuilder::new().worker_threads(4).build();
    pool.register_current_thread();

    c.bench_function("dispatch_round_trip", |b| {
        b.iter(|| {
            let (tx, rx) = std::sync::mpsc::channel();
            pool.dispatch(move || {
                let _ = tx.send(());
            });
            rx.recv().unwrap();
        })
    });

    pool.shut_down();
}

fn join_fork(c: &mut Criterion) {
    let pool = PoolBuilder::new().worker_threads(4).build();
    pool.register_current_thread();

    c.bench_function("join_fork", |b| {
        b.iter(|| {
            pool.join(|| black_box(1 + 1), || black_box(2 + 2));
        })
    });

    pool.shut_down();
}

fn parallel_for_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_for");
    for worker_threads in [1usize, 2, 4, 8] {
        let pool = PoolBuilder::new().worker_threads(worker_threads).build();
        pool.register_current_thread();
        group.bench_with_input(
            BenchmarkId::from_parameter(worker_threads),
            &worker_threads,
            |b, _| {
                b.iter(|| {
                    pool.parallel_for(100_000, |start, end, _total| {
                        for i in start..end {
                            black_box(i);
                        }
                    });
                })
            },
        );
        pool.shut_down();
    }
    group.finish();
}

criterion_group!(benches, dispatch_round_trip, join_fork, parallel_for_scaling);
criterion_main!(benches);
