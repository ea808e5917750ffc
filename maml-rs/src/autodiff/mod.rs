//! Reverse-mode automatic differentiation with higher-order support.
//!
//! Operations are recorded on a [`Tape`]; [`grad`] walks the tape backwards
//! and records the gradient computation on the same tape. With
//! [`GraphMode::Retain`] the resulting gradients are themselves differentiable,
//! which is what lets the meta-gradient flow through the inner-loop updates.
//! Node values are candle tensors; the graph itself lives on the tape.
//!
//! ```rust
//! use maml_rs::autodiff::{grad, GraphMode, Tape};
//! use maml_rs::tensor;
//!
//! let mut tape = Tape::new();
//! let x = tape.parameter(tensor::scalar(3.0)?);
//! let y = tape.mul(x, x)?;
//! let dy = grad(&mut tape, y, &[x], GraphMode::Retain)?[0];
//! let d2y = grad(&mut tape, dy, &[x], GraphMode::Retain)?[0];
//! assert_eq!(tensor::item(tape.value(dy))?, 6.0);
//! assert_eq!(tensor::item(tape.value(d2y))?, 2.0);
//! # Ok::<(), maml_rs::MamlError>(())
//! ```

mod backward;
mod tape;

pub use backward::{grad, GraphMode};
pub use tape::{Tape, Var};
