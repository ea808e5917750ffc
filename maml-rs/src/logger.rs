//! Per-run metric record.

use serde::{Deserialize, Serialize};

use crate::evaluator::EvalReport;
use crate::error::Result;
use crate::params::{Params, ParamsRecord};

/// Evaluation results of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    /// Outer iteration the checkpoint was taken at.
    pub iteration: usize,
    /// Seconds since training started.
    pub elapsed_secs: f64,
    /// Evaluation on the training family.
    pub train: EvalReport,
    /// Evaluation on the validation family.
    pub valid: EvalReport,
    /// Evaluation on the test family.
    pub test: EvalReport,
}

/// Metrics of a training run and the best parameters by validation loss.
///
/// All sequences are indexed by checkpoint. Metric values may be non-finite
/// after a diverged run and are stored so that they read back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Logger {
    /// Mean training-family loss.
    #[serde(with = "crate::nonfinite::vec")]
    pub train_loss: Vec<f64>,
    /// Training-family confidence half-width.
    #[serde(with = "crate::nonfinite::vec")]
    pub train_conf: Vec<f64>,
    /// Mean validation-family loss.
    #[serde(with = "crate::nonfinite::vec")]
    pub valid_loss: Vec<f64>,
    /// Validation-family confidence half-width.
    #[serde(with = "crate::nonfinite::vec")]
    pub valid_conf: Vec<f64>,
    /// Mean test-family loss.
    #[serde(with = "crate::nonfinite::vec")]
    pub test_loss: Vec<f64>,
    /// Test-family confidence half-width.
    #[serde(with = "crate::nonfinite::vec")]
    pub test_conf: Vec<f64>,
    /// Outer iteration of each checkpoint.
    pub checkpoint_iters: Vec<usize>,
    /// Seconds since the start of training at each checkpoint.
    #[serde(with = "crate::nonfinite::vec")]
    pub elapsed_secs: Vec<f64>,
    /// Shared parameters at the best validation checkpoint.
    pub best_valid_params: Option<ParamsRecord>,
    /// Iteration of the best validation checkpoint.
    pub best_valid_iter: Option<usize>,
}

impl Logger {
    /// Empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one checkpoint.
    pub fn record_checkpoint(&mut self, checkpoint: &Checkpoint) {
        self.train_loss.push(checkpoint.train.mean_loss);
        self.train_conf.push(checkpoint.train.confidence);
        self.valid_loss.push(checkpoint.valid.mean_loss);
        self.valid_conf.push(checkpoint.valid.confidence);
        self.test_loss.push(checkpoint.test.mean_loss);
        self.test_conf.push(checkpoint.test.confidence);
        self.checkpoint_iters.push(checkpoint.iteration);
        self.elapsed_secs.push(checkpoint.elapsed_secs);
    }

    /// Number of recorded checkpoints.
    #[must_use]
    pub fn num_checkpoints(&self) -> usize {
        self.checkpoint_iters.len()
    }

    /// Whether the latest validation loss is the lowest so far.
    #[must_use]
    pub fn is_best_valid(&self) -> bool {
        match self.valid_loss.last() {
            Some(&last) => {
                let best = self.valid_loss.iter().copied().fold(f64::INFINITY, f64::min);
                last <= best
            }
            None => false,
        }
    }

    /// Keep `params` as the best snapshot if the latest checkpoint is the
    /// best so far. Returns whether the snapshot was replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters cannot be read back.
    pub fn update_best(&mut self, params: &Params) -> Result<bool> {
        if !self.is_best_valid() {
            return Ok(false);
        }
        let iteration = self.checkpoint_iters.last().copied();
        tracing::info!(iteration = ?iteration, "saving best model");
        self.best_valid_params = Some(params.to_record()?);
        self.best_valid_iter = iteration;
        Ok(true)
    }

    /// Log the latest checkpoint.
    pub fn print_info(&self) {
        let Some(last) = self.num_checkpoints().checked_sub(1) else {
            return;
        };
        tracing::info!(
            iteration = self.checkpoint_iters[last],
            elapsed_secs = format!("{:.1}", self.elapsed_secs[last]),
            "train loss {:.3} +/- {:.3}, valid loss {:.3} +/- {:.3}, test loss {:.3} +/- {:.3}",
            self.train_loss[last],
            self.train_conf[last],
            self.valid_loss[last],
            self.valid_conf[last],
            self.test_loss[last],
            self.test_conf[last],
        );
    }
}
