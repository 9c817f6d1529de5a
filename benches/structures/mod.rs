use criterion::Criterion;

pub mod pool;
pub mod tree;

pub fn register_benchmarks(c: &mut Criterion) {
    tree::register_benchmarks(c);
    pool::register_benchmarks(c);
}
