//! Adaptable functions.
//!
//! An [`AdaptableFunction`] maps an input batch to an output batch using a
//! [`ParameterSet`](crate::params::ParameterSet) supplied at call time. The
//! function itself only knows its architecture, so the same instance can be
//! evaluated with the shared meta-parameters, a task-adapted copy, or a
//! snapshot loaded from disk.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::autodiff::{Tape, Var};
use crate::error::{MamlError, Result};
use crate::params::{Layout, ParameterSet, Params, TapeParams};
use crate::tensor::{self, Tensor};

/// A differentiable mapping driven by an external parameter set.
///
/// Implementations must be pure with respect to `self`: all trainable state
/// lives in the parameters passed to [`forward`](Self::forward).
pub trait AdaptableFunction {
    /// Record the forward pass on `tape`.
    ///
    /// # Arguments
    ///
    /// * `tape` - Tape the computation is recorded on
    /// * `params` - Parameters registered on the same tape
    /// * `inputs` - Input batch of shape `[batch, num_inputs]`
    ///
    /// # Returns
    ///
    /// Output batch of shape `[batch, num_outputs]`.
    ///
    /// # Errors
    ///
    /// Returns an error if `params` does not match the architecture.
    fn forward(&self, tape: &mut Tape, params: &TapeParams, inputs: Var) -> Result<Var>;

    /// Fresh parameters drawn from the function's initialisation scheme.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter tensor cannot be built.
    fn init_params(&self, rng: &mut dyn RngCore) -> Result<Params>;

    /// Structure of the parameter sets this function accepts.
    fn layout(&self) -> Layout;

    /// Evaluate without recording gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if `params` or `inputs` do not match the architecture.
    fn predict(&self, params: &Params, inputs: &Tensor) -> Result<Tensor> {
        let mut tape = Tape::new();
        let vars = params.register_constants(&mut tape);
        let x = tape.constant(inputs.clone());
        let y = self.forward(&mut tape, &vars, x)?;
        Ok(tape.value(y).clone())
    }
}

/// Fully-connected network conditioned on a per-task context vector.
///
/// Layer widths are `hidden ++ [num_outputs]`; the first layer sees
/// `num_inputs + num_context_params` features because the context vector is
/// appended to every input row. Every layer but the last applies a ReLU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlpFunction {
    num_inputs: usize,
    num_outputs: usize,
    hidden: Vec<usize>,
    num_context_params: usize,
}

impl MlpFunction {
    /// Describe a network.
    #[must_use]
    pub fn new(
        num_inputs: usize,
        num_outputs: usize,
        hidden: Vec<usize>,
        num_context_params: usize,
    ) -> Self {
        Self {
            num_inputs,
            num_outputs,
            hidden,
            num_context_params,
        }
    }

    /// Input features per row.
    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Output features per row.
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Hidden-layer widths.
    #[must_use]
    pub fn hidden(&self) -> &[usize] {
        &self.hidden
    }

    /// Length of the context vector.
    #[must_use]
    pub fn num_context_params(&self) -> usize {
        self.num_context_params
    }

    /// `(fan_in, fan_out)` of every layer.
    fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut dims = Vec::with_capacity(self.hidden.len() + 1);
        let mut fan_in = self.num_inputs + self.num_context_params;
        for &fan_out in self.hidden.iter().chain(std::iter::once(&self.num_outputs)) {
            dims.push((fan_in, fan_out));
            fan_in = fan_out;
        }
        dims
    }
}

impl AdaptableFunction for MlpFunction {
    fn forward(&self, tape: &mut Tape, params: &TapeParams, inputs: Var) -> Result<Var> {
        let layout = self.layout();
        if params.layout() != layout {
            return Err(MamlError::ParameterCountMismatch {
                expected: layout.len(),
                actual: params.len(),
            });
        }
        let batch = tensor::dims2("forward", tape.value(inputs))?.0;

        let mut h = inputs;
        if self.num_context_params > 0 {
            let context = tape.broadcast_rows(*params.context(), batch)?;
            h = tape.concat_cols(h, context)?;
        }

        let last = layout.weights - 1;
        for (i, (&w, &b)) in params.weights().iter().zip(params.biases()).enumerate() {
            let xw = tape.matmul(h, w)?;
            let bias = tape.broadcast_rows(b, batch)?;
            h = tape.add(xw, bias)?;
            if i < last {
                h = tape.relu(h)?;
            }
        }
        Ok(h)
    }

    #[allow(clippy::cast_precision_loss)]
    fn init_params(&self, rng: &mut dyn RngCore) -> Result<Params> {
        let dims = self.layer_dims();
        let mut weights = Vec::with_capacity(dims.len());
        let mut biases = Vec::with_capacity(dims.len());
        for &(fan_in, fan_out) in &dims {
            let bound = 1.0 / (fan_out as f64).sqrt();
            weights.push(tensor::uniform(&[fan_in, fan_out], -bound, bound, rng)?);
            biases.push(tensor::uniform(&[fan_out], -bound, bound, rng)?);
        }
        let context = tensor::zeros(&[self.num_context_params])?;
        Ok(ParameterSet::new(weights, biases, context))
    }

    fn layout(&self) -> Layout {
        let layers = self.hidden.len() + 1;
        Layout {
            weights: layers,
            biases: layers,
        }
    }
}
