//! Properties of the inner loop, the meta-gradient and the evaluator.

use maml_rs::autodiff::{grad, GraphMode, Tape, Var};
use maml_rs::tasks::LinearTask;
use maml_rs::{
    tensor, AdaptableFunction, AdaptationMode, BoxedTask, Evaluator, InnerLoop, Layout,
    LinearTaskFamily, MetaGradientAccumulator, MlpFunction, ParameterSet, Params, Result,
    TapeParams, TaskFamily, Tensor,
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// `f(x) = x @ w` with a single `[1, 1]` weight, no biases and no context.
struct ScalarFunction {
    init: f64,
}

impl ScalarFunction {
    fn params(w: f64) -> Params {
        ParameterSet::new(
            vec![tensor::from_vec(vec![w], &[1, 1]).unwrap()],
            vec![],
            tensor::zeros(&[0]).unwrap(),
        )
    }
}

impl AdaptableFunction for ScalarFunction {
    fn forward(&self, tape: &mut Tape, params: &TapeParams, inputs: Var) -> Result<Var> {
        tape.matmul(inputs, params.weights()[0])
    }

    fn init_params(&self, _rng: &mut dyn RngCore) -> Result<Params> {
        Ok(Self::params(self.init))
    }

    fn layout(&self) -> Layout {
        Layout {
            weights: 1,
            biases: 0,
        }
    }
}

/// Family with deterministic inputs: `train` when `k` matches its row count,
/// `test` otherwise. Every task is `y = slope * x`.
struct FixedFamily {
    train: Vec<f64>,
    test: Vec<f64>,
    slope: f64,
}

impl FixedFamily {
    fn new(train: Vec<f64>, test: Vec<f64>, slope: f64) -> Self {
        Self { train, test, slope }
    }

    fn k_train(&self) -> usize {
        self.train.len()
    }

    fn k_test(&self) -> usize {
        self.test.len()
    }

    fn train_inputs(&self) -> Tensor {
        tensor::column(self.train.clone()).unwrap()
    }

    fn test_inputs(&self) -> Tensor {
        tensor::column(self.test.clone()).unwrap()
    }

    fn targets(&self, inputs: &Tensor) -> Tensor {
        inputs.affine(self.slope, 0.0).unwrap()
    }

    fn tasks(&self, count: usize) -> Vec<BoxedTask> {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        self.sample_tasks(count, &mut rng)
    }
}

impl TaskFamily for FixedFamily {
    fn name(&self) -> &str {
        "fixed"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn sample_task(&self, _rng: &mut dyn RngCore) -> BoxedTask {
        Box::new(LinearTask::new(self.slope))
    }

    fn sample_inputs(
        &self,
        k: usize,
        _order_inputs: bool,
        _rng: &mut dyn RngCore,
    ) -> Result<Tensor> {
        let xs = if k == self.k_train() {
            &self.train
        } else {
            &self.test
        };
        tensor::column(xs.clone())
    }

    fn input_range(&self) -> Result<Tensor> {
        tensor::linspace(-1.0, 1.0, 11)
    }
}

fn accumulator(
    family: &FixedFamily,
    lr: f64,
    steps: usize,
    mode: AdaptationMode,
) -> MetaGradientAccumulator {
    MetaGradientAccumulator::new(
        InnerLoop::new(lr, steps, mode),
        family.k_train(),
        family.k_test(),
    )
}

/// Meta-gradient of the scalar model at weight `w` for one task.
fn scalar_meta_gradient(family: &FixedFamily, w: f64, lr: f64, mode: AdaptationMode) -> f64 {
    let f = ScalarFunction { init: w };
    let shared = f.init_params(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let meta = accumulator(family, lr, 1, mode)
        .accumulate(&f, &shared, &family.tasks(1), family, &mut rng)
        .unwrap();
    values(&meta.gradient.weights()[0])[0]
}

fn values(t: &Tensor) -> Vec<f64> {
    tensor::to_vec(t).unwrap()
}

fn assert_params_close(a: &Params, b: &Params, tol: f64) {
    let a = a.to_record().unwrap();
    let b = b.to_record().unwrap();
    assert_eq!(a.layout(), b.layout());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(x.shape, y.shape);
        for (u, v) in x.data.iter().zip(&y.data) {
            assert!((u - v).abs() <= tol, "{u} vs {v}");
        }
    }
}

#[test]
fn test_zero_inner_steps_is_identity() {
    let f = MlpFunction::new(1, 1, vec![10, 10], 4);
    let params = f.init_params(&mut ChaCha8Rng::seed_from_u64(8)).unwrap();
    let x = tensor::linspace(-1.0, 1.0, 5).unwrap();
    let y = x.sin().unwrap();

    for mode in [AdaptationMode::SecondOrder, AdaptationMode::FirstOrder] {
        let adapted = InnerLoop::new(0.3, 0, mode)
            .adapt_params(&f, &params, &x, &y)
            .unwrap();
        assert_eq!(
            adapted.params.to_record().unwrap(),
            params.to_record().unwrap()
        );
    }
}

#[test]
fn test_single_inner_step_on_scalar_model_gives_exact_value() {
    // L = (w x - y)^2 at w = 0, x = 2, y = 4: dL/dw = -16, w' = 0 - 0.5 * -16 = 8
    let f = ScalarFunction { init: 0.0 };
    let params = f.init_params(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();
    let x = tensor::column(vec![2.0]).unwrap();
    let y = tensor::column(vec![4.0]).unwrap();
    let adapted = InnerLoop::new(0.5, 1, AdaptationMode::SecondOrder)
        .adapt_params(&f, &params, &x, &y)
        .unwrap();

    assert_eq!(values(&adapted.params.weights()[0]), vec![8.0]);
    assert_eq!(adapted.losses, vec![16.0]);
    assert_eq!(
        params.to_record().unwrap(),
        ScalarFunction::params(0.0).to_record().unwrap()
    );
}

#[test]
fn test_adaptation_never_mutates_shared_parameters() {
    let f = MlpFunction::new(1, 1, vec![8], 2);
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let shared = f.init_params(&mut rng).unwrap();
    let snapshot = shared.to_record().unwrap();
    let family = LinearTaskFamily::new();
    let tasks = family.sample_tasks(5, &mut rng);

    let inner = InnerLoop::new(0.1, 3, AdaptationMode::SecondOrder);
    MetaGradientAccumulator::new(inner, 5, 5)
        .accumulate(&f, &shared, &tasks, &family, &mut rng)
        .unwrap();
    Evaluator::new(0.1, 5)
        .with_n_tasks(5)
        .evaluate(&f, &shared, &family, 3, &mut rng)
        .unwrap();

    assert_eq!(shared.to_record().unwrap(), snapshot);
}

#[test]
fn test_meta_gradient_length_independent_of_batch_size() {
    let f = MlpFunction::new(1, 1, vec![6, 6, 6], 3);
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let shared = f.init_params(&mut rng).unwrap();
    let family = LinearTaskFamily::new();
    let inner = InnerLoop::new(0.05, 1, AdaptationMode::SecondOrder);
    let acc = MetaGradientAccumulator::new(inner, 4, 4);

    for batch in [1, 2, 7] {
        let tasks = family.sample_tasks(batch, &mut rng);
        let meta = acc.accumulate(&f, &shared, &tasks, &family, &mut rng).unwrap();
        assert_eq!(meta.gradient.len(), 4 + 4 + 1);
        assert_eq!(meta.gradient.into_ordered().len(), shared.len());
    }
}

#[test]
fn test_identical_tasks_average_to_single_task_gradient() {
    let family = FixedFamily::new(vec![-0.5, 0.25, 1.0], vec![-1.0, 0.0, 0.5, 0.75], 1.7);
    let f = MlpFunction::new(1, 1, vec![5], 2);
    let shared = f.init_params(&mut ChaCha8Rng::seed_from_u64(3)).unwrap();
    let acc = accumulator(&family, 0.1, 2, AdaptationMode::SecondOrder);
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    let single = acc.accumulate(&f, &shared, &family.tasks(1), &family, &mut rng).unwrap();
    let batch = acc.accumulate(&f, &shared, &family.tasks(6), &family, &mut rng).unwrap();

    assert_params_close(&single.gradient, &batch.gradient, 1e-12);
    assert!((single.mean_loss - batch.mean_loss).abs() < 1e-12);
}

#[test]
fn test_first_order_matches_full_without_inner_curvature() {
    // Training input x = 0 makes the inner gradient vanish, so the adapted
    // weight equals the shared one in both modes.
    let family = FixedFamily::new(vec![0.0], vec![1.0, 1.0], 3.0);
    let full = scalar_meta_gradient(&family, 0.5, 0.1, AdaptationMode::SecondOrder);
    let first = scalar_meta_gradient(&family, 0.5, 0.1, AdaptationMode::FirstOrder);

    assert!((full - (-5.0)).abs() < 1e-12);
    assert!((full - first).abs() < 1e-12);
}

#[test]
fn test_second_order_term_for_one_inner_step() {
    // w' = w - a * 2 (w x - y) x = 0.5 + 0.5 = 1.0 with w = 0.5, a = 0.1, x = 1, y = 3
    // g  = 2 (w' 2 - 6) 2 = -16 on the test input x = 2
    // full = (1 - 2 a x^2) g = 0.8 * -16 = -12.8, first order = g
    let family = FixedFamily::new(vec![1.0], vec![2.0, 2.0], 3.0);
    let full = scalar_meta_gradient(&family, 0.5, 0.1, AdaptationMode::SecondOrder);
    let first = scalar_meta_gradient(&family, 0.5, 0.1, AdaptationMode::FirstOrder);

    assert!((full - (-12.8)).abs() < 1e-9, "full = {full}");
    assert!((first - (-16.0)).abs() < 1e-9, "first = {first}");
}

#[test]
fn test_first_and_second_order_differ_for_several_steps() {
    let family = FixedFamily::new(vec![0.5, 1.0], vec![-1.0, 0.4, 2.0], -1.2);
    let f = MlpFunction::new(1, 1, vec![4], 1);
    let shared = f.init_params(&mut ChaCha8Rng::seed_from_u64(5)).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    let full = accumulator(&family, 0.2, 2, AdaptationMode::SecondOrder)
        .accumulate(&f, &shared, &family.tasks(1), &family, &mut rng)
        .unwrap();
    let first = accumulator(&family, 0.2, 2, AdaptationMode::FirstOrder)
        .accumulate(&f, &shared, &family.tasks(1), &family, &mut rng)
        .unwrap();

    assert!((full.mean_loss - first.mean_loss).abs() < 1e-12);
    let full = full.gradient.to_record().unwrap();
    let first = first.gradient.to_record().unwrap();
    let difference: f64 = full
        .iter()
        .zip(first.iter())
        .flat_map(|(a, b)| a.data.iter().zip(&b.data).map(|(u, v)| (u - v).abs()))
        .sum();
    assert!(difference > 1e-6, "difference = {difference}");
}

#[test]
fn test_zero_steps_meta_gradient_is_direct_gradient() {
    let family = FixedFamily::new(vec![0.3, -0.7], vec![-0.9, -0.1, 0.4, 0.8, 1.0], 0.6);
    let f = MlpFunction::new(1, 1, vec![7], 2);
    let shared = f.init_params(&mut ChaCha8Rng::seed_from_u64(6)).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    let meta = accumulator(&family, 0.1, 0, AdaptationMode::SecondOrder)
        .accumulate(&f, &shared, &family.tasks(1), &family, &mut rng)
        .unwrap();

    let mut tape = Tape::new();
    let theta = shared.register(&mut tape);
    let x = tape.constant(family.test_inputs());
    let y = tape.constant(family.targets(&family.test_inputs()));
    let prediction = f.forward(&mut tape, &theta, x).unwrap();
    let loss = tape.mse(prediction, y).unwrap();
    let direct = grad(&mut tape, loss, &theta.to_vec(), GraphMode::Detach).unwrap();
    let direct = ParameterSet::from_ordered(direct, shared.layout()).unwrap().values(&tape);

    assert_params_close(&meta.gradient, &direct, 1e-12);
    assert!((meta.mean_loss - tensor::item(tape.value(loss)).unwrap()).abs() < 1e-12);
}

#[test]
fn test_second_order_meta_gradient_matches_finite_differences() {
    let family = FixedFamily::new(vec![-0.6, 0.2, 0.9], vec![-0.3, 0.5], 1.4);
    let f = MlpFunction::new(1, 1, vec![3], 1);
    let shared = f.init_params(&mut ChaCha8Rng::seed_from_u64(9)).unwrap();
    let inner = InnerLoop::new(0.15, 2, AdaptationMode::SecondOrder);
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    let meta = MetaGradientAccumulator::new(inner, family.k_train(), family.k_test())
        .accumulate(&f, &shared, &family.tasks(1), &family, &mut rng)
        .unwrap();

    let (train_x, test_x) = (family.train_inputs(), family.test_inputs());
    let (train_y, test_y) = (family.targets(&train_x), family.targets(&test_x));
    let meta_loss = |params: &Params| -> f64 {
        let adapted = inner.adapt_params(&f, params, &train_x, &train_y).unwrap();
        let prediction = f.predict(&adapted.params, &test_x).unwrap();
        tensor::mse(&prediction, &test_y).unwrap()
    };
    let nudged = |slot: usize, j: usize, delta: f64| -> Params {
        let mut record = shared.to_record().unwrap();
        record.iter_mut().nth(slot).unwrap().data[j] += delta;
        record.to_params().unwrap()
    };

    let eps = 1e-6;
    let analytic = meta.gradient.to_record().unwrap().into_ordered();
    for (slot, exact_slot) in analytic.iter().enumerate() {
        for (j, &exact) in exact_slot.data.iter().enumerate() {
            let numeric = (meta_loss(&nudged(slot, j, eps)) - meta_loss(&nudged(slot, j, -eps)))
                / (2.0 * eps);
            assert!(
                (numeric - exact).abs() < 1e-5 * (1.0 + exact.abs()),
                "slot {slot}[{j}]: numeric {numeric} vs analytic {exact}"
            );
        }
    }
}

#[test]
fn test_confidence_half_width_shrinks_with_more_tasks() {
    let f = MlpFunction::new(1, 1, vec![], 0);
    let shared = f.init_params(&mut ChaCha8Rng::seed_from_u64(10)).unwrap();
    let family = LinearTaskFamily::new();

    let few = Evaluator::new(0.1, 5)
        .with_n_tasks(10)
        .evaluate(&f, &shared, &family, 1, &mut ChaCha8Rng::seed_from_u64(11))
        .unwrap();
    let many = Evaluator::new(0.1, 5)
        .with_n_tasks(400)
        .evaluate(&f, &shared, &family, 1, &mut ChaCha8Rng::seed_from_u64(11))
        .unwrap();

    assert_eq!(few.n_tasks, 10);
    assert_eq!(many.n_tasks, 400);
    assert!(many.confidence < few.confidence);
}
