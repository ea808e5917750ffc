//! # maml-rs
//!
//! Model-agnostic meta-learning (MAML) for few-shot regression.
//!
//! A small network is meta-trained so that a handful of gradient steps on a
//! few examples of a new task is enough to fit it. Training is bi-level:
//!
//! - the **inner loop** ([`InnerLoop`]) adapts a copy of the shared
//!   parameters to one task with plain gradient descent;
//! - the **meta-gradient** ([`MetaGradientAccumulator`]) differentiates the
//!   post-adaptation loss on held-out inputs with respect to the shared
//!   parameters, through the inner updates, and averages it over a task batch;
//! - the **outer optimizer** ([`AdamWOptimizer`], candle's AdamW without
//!   weight decay) applies the averaged meta-gradient;
//! - the **evaluator** ([`Evaluator`]) scores few-shot adaptation on fresh
//!   tasks with a 95% Student-t confidence interval.
//!
//! Differentiating through the inner loop needs second-order gradients, which
//! the embedded [`autodiff`] tape provides. Tape values are
//! [`candle_core::Tensor`]s in `f64` on the CPU. First-order MAML is
//! available by setting `first_order = true`.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write the defaults for the sinusoid task
//! maml init --task sine config.toml
//!
//! # Validate configuration
//! maml validate config.toml
//!
//! # Start training; results land in results/sine_result_files/
//! maml train config.toml --log-interval 1000
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use maml_rs::{run, MamlConfig, RunOptions};
//!
//! # fn main() -> maml_rs::Result<()> {
//! let config = MamlConfig::from_file("config.toml")?;
//! let logger = run(&config, &RunOptions::default())?;
//! println!("best validation iteration: {:?}", logger.best_valid_iter);
//! # Ok(())
//! # }
//! ```
//!
//! ## Parameter ordering
//!
//! Every flat view of a [`ParameterSet`] lists the weights in layer order,
//! then the biases in layer order, then the context vector. Gradients use the
//! same type, so `gradient.len() == weights + biases + 1` always holds.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::float_cmp)]

pub mod autodiff;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod function;
pub mod inner;
pub mod logger;
pub mod meta;
mod nonfinite;
pub mod optimizer;
pub mod params;
pub mod persistence;
pub mod tasks;
pub mod tensor;
pub mod trainer;

pub use config::MamlConfig;
pub use error::{MamlError, Result};
pub use evaluator::{confidence_interval, EvalReport, Evaluator};
pub use function::{AdaptableFunction, MlpFunction};
pub use inner::{Adaptation, AdaptationMode, InnerLoop};
pub use logger::{Checkpoint, Logger};
pub use meta::{MetaGradient, MetaGradientAccumulator};
pub use optimizer::{AdamConfig, AdamWOptimizer};
pub use params::{
    GradientVector, Layout, ParamSlot, ParameterSet, Params, ParamsRecord, TapeParams,
};
pub use persistence::ResultStore;
pub use tasks::{BoxedTask, LinearTaskFamily, SineTaskFamily, Task, TaskFamily};
pub use tensor::{Tensor, TensorRecord};
pub use trainer::{
    run, InitContext, IterationReport, MamlTrainer, RunOptions, TrainerState,
    DEFAULT_LOG_INTERVAL,
};
