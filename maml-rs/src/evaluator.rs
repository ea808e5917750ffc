//! Held-out evaluation of adaptation performance.
//!
//! The evaluator samples fresh tasks, adapts a copy of the shared parameters
//! to a few inputs of each, and scores the adapted copy over the whole input
//! domain of the family. The shared parameters are only read.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::config::MamlConfig;
use crate::error::{MamlError, Result};
use crate::function::AdaptableFunction;
use crate::inner::{AdaptationMode, InnerLoop};
use crate::params::Params;
use crate::tasks::TaskFamily;
use crate::tensor;

/// Confidence level of reported intervals.
pub const CONFIDENCE_LEVEL: f64 = 0.95;

/// Default number of tasks per evaluation.
pub const DEFAULT_EVAL_TASKS: usize = 100;

/// Summary of one evaluation round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    /// Mean domain-wide loss after adaptation.
    pub mean_loss: f64,
    /// Half-width of the 95% Student-t interval around `mean_loss`.
    pub confidence: f64,
    /// Mean per-step gradient norm during adaptation, when tracked.
    pub mean_grad_norm: Option<f64>,
    /// Number of tasks evaluated.
    pub n_tasks: usize,
}

/// Few-shot evaluation over freshly sampled tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluator {
    lr_inner: f64,
    k_shot: usize,
    n_tasks: usize,
    order_inputs: bool,
    track_grad_norm: bool,
}

impl Evaluator {
    /// Adapt with step size `lr_inner` on `k_shot` inputs per task.
    #[must_use]
    pub fn new(lr_inner: f64, k_shot: usize) -> Self {
        Self {
            lr_inner,
            k_shot,
            n_tasks: DEFAULT_EVAL_TASKS,
            order_inputs: false,
            track_grad_norm: false,
        }
    }

    /// Evaluator for the settings in `config`.
    #[must_use]
    pub fn from_config(config: &MamlConfig) -> Self {
        Self::new(config.lr_inner, config.k_shot_eval)
            .with_n_tasks(config.n_eval_tasks)
            .with_order_inputs(config.order_pixels)
    }

    /// Set the number of tasks per evaluation.
    #[must_use]
    pub fn with_n_tasks(mut self, n_tasks: usize) -> Self {
        self.n_tasks = n_tasks;
        self
    }

    /// Sort sampled inputs.
    #[must_use]
    pub fn with_order_inputs(mut self, order_inputs: bool) -> Self {
        self.order_inputs = order_inputs;
        self
    }

    /// Record the mean gradient norm during adaptation.
    #[must_use]
    pub fn with_grad_norm(mut self, track: bool) -> Self {
        self.track_grad_norm = track;
        self
    }

    /// Tasks per evaluation.
    #[must_use]
    pub fn n_tasks(&self) -> usize {
        self.n_tasks
    }

    /// Evaluate `shared` on `n_tasks` tasks from `family`.
    ///
    /// Each task starts from the same copy of `shared` and takes
    /// `num_updates` first-order steps.
    ///
    /// # Errors
    ///
    /// Returns an error if adaptation fails or fewer than two tasks are
    /// evaluated.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate<F>(
        &self,
        function: &F,
        shared: &Params,
        family: &dyn TaskFamily,
        num_updates: usize,
        rng: &mut dyn RngCore,
    ) -> Result<EvalReport>
    where
        F: AdaptableFunction + ?Sized,
    {
        let reference = shared.clone();
        let inner = InnerLoop::new(self.lr_inner, num_updates, AdaptationMode::FirstOrder);
        let input_range = family.input_range()?;

        let mut losses = Vec::with_capacity(self.n_tasks);
        let mut grad_norms = Vec::new();
        for _ in 0..self.n_tasks {
            let task = family.sample_task(rng);
            let inputs = family.sample_inputs(self.k_shot, self.order_inputs, rng)?;
            let targets = task.targets(&inputs)?;
            let adapted = inner.adapt_params(function, &reference, &inputs, &targets)?;
            if self.track_grad_norm {
                grad_norms.extend(adapted.grad_norms);
            }

            let prediction = function.predict(&adapted.params, &input_range)?;
            losses.push(tensor::mse(&prediction, &task.targets(&input_range)?)?);
        }

        let (mean_loss, confidence) = confidence_interval(&losses, CONFIDENCE_LEVEL)?;
        let mean_grad_norm = (self.track_grad_norm && !grad_norms.is_empty())
            .then(|| grad_norms.iter().sum::<f64>() / grad_norms.len() as f64);

        Ok(EvalReport {
            mean_loss,
            confidence,
            mean_grad_norm,
            n_tasks: losses.len(),
        })
    }
}

/// Mean and Student-t confidence half-width of `samples`.
///
/// The half-width is `t_{(1+level)/2, n-1} * s / sqrt(n)` with `s` the sample
/// standard deviation. Identical samples have a zero standard error, which
/// does not define a Student-t interval; their half-width is NaN.
///
/// # Errors
///
/// Returns [`MamlError::Statistics`] for fewer than two samples or a level
/// outside `(0, 1)`.
#[allow(clippy::cast_precision_loss)]
pub fn confidence_interval(samples: &[f64], level: f64) -> Result<(f64, f64)> {
    let n = samples.len();
    if n < 2 {
        return Err(MamlError::Statistics(format!(
            "confidence interval needs at least 2 samples, got {n}"
        )));
    }
    if !(level > 0.0 && level < 1.0) {
        return Err(MamlError::Statistics(format!(
            "confidence level must be in (0, 1), got {level}"
        )));
    }

    let count = n as f64;
    let mean = samples.iter().sum::<f64>() / count;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (count - 1.0);
    let sem = (variance / count).sqrt();
    if sem == 0.0 {
        return Ok((mean, f64::NAN));
    }

    let t = StudentsT::new(0.0, 1.0, count - 1.0)
        .map_err(|e| MamlError::Statistics(e.to_string()))?;
    let critical = t.inverse_cdf(0.5 + level / 2.0);
    Ok((mean, critical * sem))
}
