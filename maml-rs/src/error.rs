//! Error types for maml-rs.
//!
//! Every fallible operation in the crate returns [`Result`]. Nothing in the
//! meta-training core is retried: an error raised while adapting or evaluating
//! a single task aborts the whole outer iteration, because dropping that task
//! would bias the meta-gradient average.
//!
//! # Example
//!
//! ```rust
//! use maml_rs::{MamlConfig, MamlError};
//!
//! match MamlConfig::default_for("celeba") {
//!     Ok(_) => unreachable!(),
//!     Err(MamlError::UnsupportedTask(task)) => assert_eq!(task, "celeba"),
//!     Err(e) => panic!("unexpected error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for maml-rs operations.
pub type Result<T> = std::result::Result<T, MamlError>;

/// Errors that can occur in maml-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MamlError {
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized.
    #[error("config serialization failed: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// The task identity has no task family.
    #[error("unsupported task: {0}")]
    UnsupportedTask(String),

    /// Tensor shapes are incompatible for an operation.
    #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        /// Operation that rejected the shapes.
        op: &'static str,
        /// Left-hand (or expected) shape.
        lhs: Vec<usize>,
        /// Right-hand (or actual) shape.
        rhs: Vec<usize>,
    },

    /// A flat gradient or parameter vector does not line up with the
    /// weights → biases → context ordering of its parameter set.
    #[error("parameter count mismatch: expected {expected} tensors, got {actual}")]
    ParameterCountMismatch {
        /// Expected number of tensors (`weights + biases + 1`).
        expected: usize,
        /// Number of tensors supplied.
        actual: usize,
    },

    /// Gradients can only be taken of single-element outputs.
    #[error("gradient requires a scalar output, got shape {0:?}")]
    NonScalarOutput(Vec<usize>),

    /// A meta-update was requested over zero tasks.
    #[error("empty task batch: {0}")]
    EmptyTaskBatch(String),

    /// Statistical summary could not be computed.
    #[error("statistics error: {0}")]
    Statistics(String),

    /// Result store failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// JSON encoding or decoding of a stored result failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Tensor kernel or optimizer failure inside candle.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
