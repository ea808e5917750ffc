use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use maml_rs::{
    AdaptableFunction, AdaptationMode, Evaluator, InnerLoop, MamlConfig, MetaGradientAccumulator,
    MlpFunction, SineTaskFamily, TaskFamily,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

// Sine defaults: 1 -> 40 -> 40 -> 1
fn sine_network() -> MlpFunction {
    MlpFunction::new(1, 1, vec![40, 40], 0)
}

fn bench_meta_gradient(c: &mut Criterion) {
    let mut group = c.benchmark_group("meta_gradient");
    let function = sine_network();
    let family = SineTaskFamily::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let shared = function.init_params(&mut rng).unwrap();

    for mode in [AdaptationMode::SecondOrder, AdaptationMode::FirstOrder] {
        for steps in [1, 5] {
            let accumulator =
                MetaGradientAccumulator::new(InnerLoop::new(0.01, steps, mode), 10, 10);
            let id = BenchmarkId::new(format!("{mode:?}"), format!("steps_{steps}"));
            group.bench_with_input(id, &steps, |b, _| {
                b.iter(|| {
                    let tasks = family.sample_tasks(5, &mut rng);
                    let meta = accumulator
                        .accumulate(&function, &shared, &tasks, &family, &mut rng)
                        .unwrap();
                    black_box(meta);
                });
            });
        }
    }

    group.finish();
}

fn bench_task_batch_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_batch_size");
    let function = sine_network();
    let family = SineTaskFamily::new();
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let shared = function.init_params(&mut rng).unwrap();
    let accumulator = MetaGradientAccumulator::from_config(&MamlConfig::sine_defaults());

    for batch in [1, 10, 25] {
        group.bench_with_input(format!("tasks_{batch}"), &batch, |b, &batch| {
            b.iter(|| {
                let tasks = family.sample_tasks(batch, &mut rng);
                let meta = accumulator
                    .accumulate(&function, &shared, &tasks, &family, &mut rng)
                    .unwrap();
                black_box(meta);
            });
        });
    }

    group.finish();
}

fn bench_evaluate(c: &mut Criterion) {
    c.bench_function("evaluate_100_tasks", |b| {
        let function = sine_network();
        let family = SineTaskFamily::new();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let shared = function.init_params(&mut rng).unwrap();
        let evaluator = Evaluator::from_config(&MamlConfig::sine_defaults());

        b.iter(|| {
            let report = evaluator
                .evaluate(&function, &shared, &family, 1, &mut rng)
                .unwrap();
            black_box(report);
        });
    });
}

criterion_group!(
    benches,
    bench_meta_gradient,
    bench_task_batch_size,
    bench_evaluate
);
criterion_main!(benches);
