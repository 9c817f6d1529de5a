use criterion::{criterion_group, criterion_main};

mod sequencer;
mod structures;

use sequencer::register_benchmarks as register_sequencer_benchmarks;
use structures::register_benchmarks as register_structure_benchmarks;

criterion_group!(
    benches,
    register_structure_benchmarks,
    register_sequencer_benchmarks,
);

criterion_main!(benches);
