//! Meta-gradient accumulation over a batch of tasks.

use rand::RngCore;

use crate::autodiff::{grad, GraphMode, Tape};
use crate::config::MamlConfig;
use crate::error::{MamlError, Result};
use crate::function::AdaptableFunction;
use crate::inner::{AdaptationMode, InnerLoop};
use crate::params::{GradientVector, ParameterSet, Params};
use crate::tasks::{BoxedTask, Task, TaskFamily};
use crate::tensor;

/// Averaged meta-gradient of one outer iteration.
#[derive(Debug, Clone)]
pub struct MetaGradient {
    /// Mean over tasks of d(post-adaptation loss) / d(shared parameters).
    pub gradient: GradientVector,
    /// Mean post-adaptation loss on the held-out inputs.
    pub mean_loss: f64,
}

/// Runs the inner loop per task and averages the resulting meta-gradients.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaGradientAccumulator {
    inner: InnerLoop,
    k_meta_train: usize,
    k_meta_test: usize,
    order_inputs: bool,
}

impl MetaGradientAccumulator {
    /// Adapt on `k_meta_train` inputs per task and score on `k_meta_test`
    /// fresh inputs.
    #[must_use]
    pub fn new(inner: InnerLoop, k_meta_train: usize, k_meta_test: usize) -> Self {
        Self {
            inner,
            k_meta_train,
            k_meta_test,
            order_inputs: false,
        }
    }

    /// Accumulator for the training settings in `config`.
    #[must_use]
    pub fn from_config(config: &MamlConfig) -> Self {
        let inner = InnerLoop::new(
            config.lr_inner,
            config.num_inner_updates,
            AdaptationMode::from_first_order(config.first_order),
        );
        Self::new(inner, config.k_meta_train, config.k_meta_test)
            .with_order_inputs(config.order_pixels)
    }

    /// Sort sampled inputs.
    #[must_use]
    pub fn with_order_inputs(mut self, order_inputs: bool) -> Self {
        self.order_inputs = order_inputs;
        self
    }

    /// Inner-loop settings.
    #[must_use]
    pub fn inner(&self) -> &InnerLoop {
        &self.inner
    }

    /// Mean meta-gradient of `shared` over `tasks`.
    ///
    /// Every task contributes with equal weight. A failure on any task aborts
    /// the whole batch.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::EmptyTaskBatch`] for an empty batch, or the first
    /// error raised while adapting or scoring a task.
    #[allow(clippy::cast_precision_loss)]
    pub fn accumulate<F>(
        &self,
        function: &F,
        shared: &Params,
        tasks: &[BoxedTask],
        family: &dyn TaskFamily,
        rng: &mut dyn RngCore,
    ) -> Result<MetaGradient>
    where
        F: AdaptableFunction + ?Sized,
    {
        if tasks.is_empty() {
            return Err(MamlError::EmptyTaskBatch(
                "meta-update needs at least one task".to_string(),
            ));
        }

        let mut gradient = shared.zeros_like()?;
        let mut total_loss = 0.0;
        for task in tasks {
            let (task_gradient, loss) =
                self.task_gradient(function, shared, task.as_ref(), family, rng)?;
            gradient.add_assign(&task_gradient)?;
            total_loss += loss;
        }

        let count = tasks.len() as f64;
        gradient.scale_assign(1.0 / count)?;
        Ok(MetaGradient {
            gradient,
            mean_loss: total_loss / count,
        })
    }

    /// Meta-gradient and post-adaptation loss of a single task.
    ///
    /// # Errors
    ///
    /// Returns an error if adaptation or scoring fails.
    pub fn task_gradient<F>(
        &self,
        function: &F,
        shared: &Params,
        task: &dyn Task,
        family: &dyn TaskFamily,
        rng: &mut dyn RngCore,
    ) -> Result<(GradientVector, f64)>
    where
        F: AdaptableFunction + ?Sized,
    {
        let mut tape = Tape::new();
        let theta = shared.register(&mut tape);

        let train_x = family.sample_inputs(self.k_meta_train, self.order_inputs, rng)?;
        let train_y = task.targets(&train_x)?;
        let train_x = tape.constant(train_x);
        let train_y = tape.constant(train_y);
        let adapted = self.inner.adapt(&mut tape, function, &theta, train_x, train_y)?;

        let test_x = family.sample_inputs(self.k_meta_test, self.order_inputs, rng)?;
        let test_y = task.targets(&test_x)?;
        let test_x = tape.constant(test_x);
        let test_y = tape.constant(test_y);
        let prediction = function.forward(&mut tape, &adapted.params, test_x)?;
        let loss = tape.mse(prediction, test_y)?;

        let grads = grad(&mut tape, loss, &theta.to_vec(), GraphMode::Detach)?;
        let grads = ParameterSet::from_ordered(grads, shared.layout())?;
        Ok((grads.values(&tape), tensor::item(tape.value(loss))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::MlpFunction;
    use crate::tasks::SineTaskFamily;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_empty_batch_rejected() {
        let f = MlpFunction::new(1, 1, vec![4], 0);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let shared = f.init_params(&mut rng).unwrap();
        let acc = MetaGradientAccumulator::new(
            InnerLoop::new(0.01, 1, AdaptationMode::SecondOrder),
            5,
            5,
        );
        let result = acc.accumulate(&f, &shared, &[], &SineTaskFamily::new(), &mut rng);
        assert!(matches!(result, Err(MamlError::EmptyTaskBatch(_))));
    }

    #[test]
    fn test_gradient_matches_parameter_layout() {
        let f = MlpFunction::new(1, 1, vec![16, 16], 3);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let shared = f.init_params(&mut rng).unwrap();
        let family = SineTaskFamily::new();
        let acc = MetaGradientAccumulator::new(
            InnerLoop::new(0.01, 2, AdaptationMode::SecondOrder),
            10,
            10,
        );

        for batch in [1, 4] {
            let tasks = family.sample_tasks(batch, &mut rng);
            let meta = acc.accumulate(&f, &shared, &tasks, &family, &mut rng).unwrap();
            assert_eq!(meta.gradient.len(), shared.weights().len() + shared.biases().len() + 1);
            assert_eq!(meta.gradient.layout(), shared.layout());
            for (g, p) in meta.gradient.iter().zip(shared.iter()) {
                assert_eq!(g.dims(), p.dims());
            }
            assert!(meta.mean_loss.is_finite());
        }
    }

    #[test]
    fn test_shared_parameters_untouched() {
        let f = MlpFunction::new(1, 1, vec![8], 1);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let shared = f.init_params(&mut rng).unwrap();
        let before = shared.to_record().unwrap();
        let family = SineTaskFamily::new();
        let tasks = family.sample_tasks(3, &mut rng);
        let acc = MetaGradientAccumulator::new(
            InnerLoop::new(0.5, 3, AdaptationMode::SecondOrder),
            5,
            5,
        );
        acc.accumulate(&f, &shared, &tasks, &family, &mut rng).unwrap();
        assert_eq!(shared.to_record().unwrap(), before);
    }

    #[test]
    fn test_from_config() {
        let mut config = MamlConfig::default_for("sine").unwrap();
        config.first_order = true;
        config.num_inner_updates = 3;
        let acc = MetaGradientAccumulator::from_config(&config);
        assert_eq!(acc.inner().mode(), AdaptationMode::FirstOrder);
        assert_eq!(acc.inner().steps(), 3);
    }
}
