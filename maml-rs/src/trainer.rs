//! Meta-training driver.
//!
//! [`MamlTrainer`] owns the shared parameters and the outer optimizer and
//! moves through `Init → Iterating → Done`. Each [`step`](MamlTrainer::step)
//! samples a task batch, accumulates the meta-gradient, applies one Adam
//! update, and every `log_interval` iterations evaluates on the train,
//! validation and test families.
//!
//! Training and evaluation draw from two streams of the run's seed, so how
//! often a run is evaluated never changes the parameters it trains.

use std::path::PathBuf;
use std::time::Instant;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::MamlConfig;
use crate::error::{MamlError, Result};
use crate::evaluator::Evaluator;
use crate::function::{AdaptableFunction, MlpFunction};
use crate::logger::{Checkpoint, Logger};
use crate::meta::MetaGradientAccumulator;
use crate::optimizer::AdamWOptimizer;
use crate::params::Params;
use crate::persistence::ResultStore;
use crate::tasks::{task_families, TaskFamilies};

/// Iterations between evaluations when not overridden.
pub const DEFAULT_LOG_INTERVAL: usize = 5000;

const EVAL_STREAM: u64 = 1;

/// Explicit initialisation inputs of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitContext {
    /// Seed of the run's random streams.
    pub seed: u64,
}

impl InitContext {
    /// Context with the given seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Context seeded from `config`.
    #[must_use]
    pub const fn from_config(config: &MamlConfig) -> Self {
        Self { seed: config.seed }
    }
}

/// Options of [`run`] that are not part of the stored configuration.
///
/// `log_interval` decides which iterations get a checkpoint. Evaluation uses
/// its own random stream, so the trained parameters do not depend on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Iterations between evaluations.
    pub log_interval: usize,
    /// Train even if a stored result exists.
    pub rerun: bool,
    /// Root of the result store.
    pub results_dir: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            log_interval: DEFAULT_LOG_INTERVAL,
            rerun: false,
            results_dir: PathBuf::from("results"),
        }
    }
}

impl RunOptions {
    /// Set the evaluation interval.
    #[must_use]
    pub fn with_log_interval(mut self, log_interval: usize) -> Self {
        self.log_interval = log_interval;
        self
    }

    /// Force training even when a stored result exists.
    #[must_use]
    pub fn with_rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    /// Set the result store root.
    #[must_use]
    pub fn with_results_dir<P: Into<PathBuf>>(mut self, results_dir: P) -> Self {
        self.results_dir = results_dir.into();
        self
    }
}

/// Position of the driver in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Parameters initialised, no update applied.
    Init,
    /// The next step performs outer iteration `iteration`.
    Iterating {
        /// Zero-based index of the next outer iteration.
        iteration: usize,
    },
    /// All configured iterations have run.
    Done,
}

/// Outcome of one outer iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport {
    /// Zero-based index of the iteration.
    pub iteration: usize,
    /// Mean post-adaptation loss over the task batch.
    pub meta_loss: f64,
    /// Euclidean norm of the averaged meta-gradient.
    pub meta_grad_norm: f64,
    /// Whether an evaluation checkpoint was taken.
    pub evaluated: bool,
}

/// Meta-training driver.
///
/// # Example
///
/// ```rust
/// use maml_rs::{InitContext, MamlConfig, MamlTrainer};
///
/// # fn main() -> maml_rs::Result<()> {
/// let mut config = MamlConfig::default_for("linear")?;
/// config.n_iter = 3;
/// config.n_eval_tasks = 4;
///
/// let trainer = MamlTrainer::new(config, InitContext::new(0), 2)?;
/// let logger = trainer.train()?;
/// assert_eq!(logger.checkpoint_iters, vec![0, 2]);
/// # Ok(())
/// # }
/// ```
pub struct MamlTrainer<F = MlpFunction> {
    config: MamlConfig,
    families: TaskFamilies,
    function: F,
    shared: Params,
    optimizer: AdamWOptimizer,
    accumulator: MetaGradientAccumulator,
    evaluator: Evaluator,
    rng: ChaCha8Rng,
    eval_rng: ChaCha8Rng,
    state: TrainerState,
    logger: Logger,
    store: Option<ResultStore>,
    log_interval: usize,
    started: Option<Instant>,
}

impl MamlTrainer<MlpFunction> {
    /// Create a trainer with the network described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the task is
    /// unsupported, or `log_interval` is zero.
    pub fn new(config: MamlConfig, context: InitContext, log_interval: usize) -> Result<Self> {
        let families = task_families(&config.task)?;
        let function = MlpFunction::new(
            families.train.num_inputs(),
            families.train.num_outputs(),
            config.n_hidden.clone(),
            config.num_context_params,
        );
        Self::with_parts(config, context, log_interval, families, function)
    }
}

impl<F: AdaptableFunction> MamlTrainer<F> {
    /// Create a trainer around a custom adaptable function.
    ///
    /// # Errors
    ///
    /// See [`MamlTrainer::new`].
    pub fn with_function(
        config: MamlConfig,
        context: InitContext,
        log_interval: usize,
        function: F,
    ) -> Result<Self> {
        let families = task_families(&config.task)?;
        Self::with_parts(config, context, log_interval, families, function)
    }

    fn with_parts(
        config: MamlConfig,
        context: InitContext,
        log_interval: usize,
        families: TaskFamilies,
        function: F,
    ) -> Result<Self> {
        config.validate()?;
        if log_interval == 0 {
            return Err(MamlError::Config("log_interval must be > 0".into()));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(context.seed);
        let mut eval_rng = ChaCha8Rng::seed_from_u64(context.seed);
        eval_rng.set_stream(EVAL_STREAM);
        let shared = function.init_params(&mut rng)?;
        tracing::debug!(
            tensors = shared.len(),
            parameters = shared.numel(),
            "initialised shared parameters"
        );

        Ok(Self {
            optimizer: config.adam().build(),
            accumulator: MetaGradientAccumulator::from_config(&config),
            evaluator: Evaluator::from_config(&config),
            config,
            families,
            function,
            shared,
            rng,
            eval_rng,
            state: TrainerState::Init,
            logger: Logger::new(),
            store: None,
            log_interval,
            started: None,
        })
    }

    /// Persist the logger to `store` at every checkpoint and at the end.
    #[must_use]
    pub fn with_store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Current shared parameters.
    #[must_use]
    pub fn shared_params(&self) -> &Params {
        &self.shared
    }

    /// Metrics recorded so far.
    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &MamlConfig {
        &self.config
    }

    /// The adaptable function being meta-trained.
    #[must_use]
    pub fn function(&self) -> &F {
        &self.function
    }

    /// Perform one outer iteration.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::Config`] once training is done, or the first
    /// error raised while adapting, updating, evaluating or saving.
    ///
    /// The state advances as soon as the meta-update is applied. An error
    /// before that leaves parameters and state untouched; an evaluation or
    /// save error after it is returned with the update kept, and the next
    /// call runs the following iteration.
    pub fn step(&mut self) -> Result<IterationReport> {
        let iteration = match self.state {
            TrainerState::Init => 0,
            TrainerState::Iterating { iteration } => iteration,
            TrainerState::Done => {
                return Err(MamlError::Config("training has already finished".into()))
            }
        };
        if iteration >= self.config.n_iter {
            self.state = TrainerState::Done;
            return Err(MamlError::Config("no iterations left to run".into()));
        }
        self.started.get_or_insert_with(Instant::now);

        let snapshot = self.shared.clone();
        let tasks = self
            .families
            .train
            .sample_tasks(self.config.tasks_per_metaupdate, &mut self.rng);
        let meta = self.accumulator.accumulate(
            &self.function,
            &snapshot,
            &tasks,
            self.families.train.as_ref(),
            &mut self.rng,
        )?;
        let meta_grad_norm = meta.gradient.norm()?;
        self.optimizer.step(&mut self.shared, &meta.gradient)?;
        self.state = if iteration + 1 >= self.config.n_iter {
            TrainerState::Done
        } else {
            TrainerState::Iterating {
                iteration: iteration + 1,
            }
        };
        tracing::debug!(iteration, meta_loss = meta.mean_loss, meta_grad_norm, "meta-update");

        let evaluated = iteration % self.log_interval == 0;
        if evaluated {
            self.evaluate_checkpoint(iteration)?;
        }

        Ok(IterationReport {
            iteration,
            meta_loss: meta.mean_loss,
            meta_grad_norm,
            evaluated,
        })
    }

    fn evaluate_checkpoint(&mut self, iteration: usize) -> Result<()> {
        let num_updates = self.config.num_inner_updates;
        let train = self.evaluator.evaluate(
            &self.function,
            &self.shared,
            self.families.train.as_ref(),
            num_updates,
            &mut self.eval_rng,
        )?;
        let valid = self.evaluator.evaluate(
            &self.function,
            &self.shared,
            self.families.valid.as_ref(),
            num_updates,
            &mut self.eval_rng,
        )?;
        let test = self.evaluator.evaluate(
            &self.function,
            &self.shared,
            self.families.test.as_ref(),
            num_updates,
            &mut self.eval_rng,
        )?;

        let elapsed_secs = self.started.map_or(0.0, |t| t.elapsed().as_secs_f64());
        self.logger.record_checkpoint(&Checkpoint {
            iteration,
            elapsed_secs,
            train,
            valid,
            test,
        });
        self.logger.print_info();
        self.logger.update_best(&self.shared)?;

        if let Some(store) = &self.store {
            store.save(&self.config, &self.logger)?;
        }
        Ok(())
    }

    /// Run every remaining iteration and return the metric record.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by [`step`](Self::step) or by the final
    /// save.
    pub fn train(mut self) -> Result<Logger> {
        tracing::info!("Starting meta-training");
        tracing::info!("  Task: {}", self.config.task);
        tracing::info!("  Iterations: {}", self.config.n_iter);
        tracing::info!(
            "  Tasks per update: {}, inner steps: {}, first order: {}",
            self.config.tasks_per_metaupdate,
            self.config.num_inner_updates,
            self.config.first_order
        );

        if self.config.n_iter == 0 {
            self.state = TrainerState::Done;
        }
        while self.state != TrainerState::Done {
            self.step()?;
        }

        if let Some(store) = &self.store {
            let path = store.save(&self.config, &self.logger)?;
            tracing::info!("Saved result to: {}", path.display());
        }
        tracing::info!("Meta-training complete");
        Ok(self.logger)
    }
}

/// Train `config` unless an identical configuration already has a stored
/// result, in which case that result is returned unchanged.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the task is
/// unsupported, the store cannot be read or written, or training fails.
pub fn run(config: &MamlConfig, options: &RunOptions) -> Result<Logger> {
    config.validate()?;
    let store = ResultStore::new(options.results_dir.clone());

    if !options.rerun {
        if let Some(logger) = store.load(config)? {
            tracing::info!(
                "Found stored result at {}; skipping training",
                store.path_for(config)?.display()
            );
            return Ok(logger);
        }
    }

    let unexpected = config.unexpected_keys();
    if !unexpected.is_empty() {
        tracing::warn!(
            "Configuration has keys that are not in the {} defaults: {:?}",
            config.task,
            unexpected
        );
    }

    MamlTrainer::new(config.clone(), InitContext::from_config(config), options.log_interval)?
        .with_store(store)
        .train()
}
