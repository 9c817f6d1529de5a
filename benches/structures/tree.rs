use criterion::{BenchmarkId, Criterion};
use exchange_sequencer::sequencer::BalancedIndexTree;
use std::hint::black_box;

/// Register level index benchmarks.
pub fn register_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("BalancedIndexTree");

    for &count in &[100i64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("insert_ascending", count), &count, |b, &n| {
            b.iter(|| {
                let mut tree = BalancedIndexTree::with_capacity(n as usize);
                for key in 0..n {
                    tree.insert(key, key);
                }
                black_box(tree.len())
            });
        });

        group.bench_with_input(BenchmarkId::new("insert_remove_mixed", count), &count, |b, &n| {
            b.iter_with_setup(
                || {
                    let mut tree = BalancedIndexTree::with_capacity(n as usize);
                    for key in 0..n {
                        tree.insert(key * 2, key);
                    }
                    tree
                },
                |mut tree| {
                    // Alternate removals from the middle with inserts into the gaps.
                    for key in 0..n / 2 {
                        tree.remove(key * 2);
                        tree.insert(key * 2 + 1, key);
                    }
                    black_box(tree.len())
                },
            );
        });

        group.bench_with_input(BenchmarkId::new("find", count), &count, |b, &n| {
            let mut tree = BalancedIndexTree::with_capacity(n as usize);
            for key in 0..n {
                tree.insert(key, key);
            }
            b.iter(|| {
                for key in (0..n).step_by(7) {
                    black_box(tree.find(key));
                }
            });
        });
    }

    group.finish();
}
