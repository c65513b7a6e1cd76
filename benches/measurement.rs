//! Criterion benchmarks for measurements and condition scheduling.
//!
//! Run with:
//!   cargo bench
//!
//! Results are saved to target/criterion/

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};

use psychometer::config::{
    ConstantStimuliConfig, ExperimentalCondition, IndexedStaircaseConfig, ProcedureConfig,
    StaircaseConfig,
};
use psychometer::prng::{Prng, RandomSource};
use psychometer::{ConditionScheduler, Measurement};

fn procedures() -> Vec<(&'static str, ProcedureConfig)> {
    vec![
        (
            "staircase",
            ProcedureConfig::Staircase(StaircaseConfig::with_defaults(0.0, 1.0, 0.01)),
        ),
        (
            "indexed",
            ProcedureConfig::IndexedStaircase(IndexedStaircaseConfig::with_defaults(
                (1..=32).map(|i| i as f32 / 32.0).collect(),
            )),
        ),
        (
            "constant_stimuli",
            ProcedureConfig::ConstantStimuli(ConstantStimuliConfig::with_defaults(vec![
                0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8,
            ])),
        ),
    ]
}

/// Run one measurement to completion with random responses.
fn bench_measurement_to_completion(c: &mut Criterion) {
    let mut group = c.benchmark_group("measurement_run");

    for (name, cfg) in procedures() {
        group.bench_with_input(BenchmarkId::new("to_completion", name), &cfg, |b, cfg| {
            let mut rng = Prng::new(42);
            b.iter_batched(
                || Measurement::new(ExperimentalCondition::new(), cfg.clone(), &mut rng).unwrap(),
                |mut m| {
                    let mut responses = Prng::new(7);
                    while !m.is_complete() {
                        let correct = responses.next_f32_01() < 0.7;
                        let _ = m.process_response(correct, &mut responses);
                    }
                    black_box(m.level())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark condition selection with many interleaved conditions.
fn bench_scheduler_choose(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_choose");

    for n in [2usize, 8, 32, 128].iter() {
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::new("conditions", n), n, |b, &n| {
            let conditions = (0..n).map(|i| {
                (
                    ExperimentalCondition::new().with("index", i as f64),
                    ProcedureConfig::Staircase(StaircaseConfig::with_defaults(0.0, 1.0, 0.01)),
                )
            });
            let mut sched = ConditionScheduler::from_conditions(conditions, Prng::new(1)).unwrap();
            let mut responses = Prng::new(9);
            b.iter(|| {
                if sched.is_complete() {
                    return black_box(None);
                }
                let correct = responses.next_f32_01() < 0.7;
                let _ = sched.process_response(correct);
                black_box(sched.choose_next_condition())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_measurement_to_completion, bench_scheduler_choose);
criterion_main!(benches);
