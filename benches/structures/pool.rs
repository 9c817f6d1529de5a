use criterion::Criterion;
use exchange_sequencer::sequencer::ObjectPool;
use std::collections::VecDeque;
use std::hint::black_box;

/// Register object pool benchmarks.
pub fn register_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("ObjectPool");

    group.bench_function("borrow_release", |b| {
        let mut pool: ObjectPool<VecDeque<u64>> = ObjectPool::new(
            || VecDeque::with_capacity(16),
            |l: &mut VecDeque<u64>| l.clear(),
            64,
        );
        b.iter(|| {
            let mut level = pool.borrow();
            level.push_back(black_box(1));
            pool.release(level);
        });
    });

    group.bench_function("allocate_without_pool", |b| {
        b.iter(|| {
            let mut level: VecDeque<u64> = VecDeque::with_capacity(16);
            level.push_back(black_box(1));
            black_box(level)
        });
    });

    group.finish();
}
