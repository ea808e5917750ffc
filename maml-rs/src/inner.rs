//! Inner-loop task adaptation.
//!
//! [`InnerLoop::adapt`] runs `K` steps of gradient descent on one task's
//! training loss, starting from parameters registered on a tape. In
//! [`AdaptationMode::SecondOrder`] each step's gradient stays on the graph,
//! so the adapted parameters remain a differentiable function of the starting
//! point. In [`AdaptationMode::FirstOrder`] the gradients are detached and only
//! the identity path from the starting point survives.

use serde::{Deserialize, Serialize};

use crate::autodiff::{grad, GraphMode, Tape, Var};
use crate::error::Result;
use crate::function::AdaptableFunction;
use crate::params::{ParameterSet, Params, TapeParams};
use crate::tensor::{self, Tensor};

/// Whether adaptation gradients stay attached to the meta-graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationMode {
    /// Differentiate through the inner updates.
    #[default]
    SecondOrder,
    /// Treat inner-loop gradients as constants.
    FirstOrder,
}

impl AdaptationMode {
    /// Mode selected by a `first_order` flag.
    #[must_use]
    pub const fn from_first_order(first_order: bool) -> Self {
        if first_order {
            Self::FirstOrder
        } else {
            Self::SecondOrder
        }
    }

    const fn graph_mode(self) -> GraphMode {
        match self {
            Self::SecondOrder => GraphMode::Retain,
            Self::FirstOrder => GraphMode::Detach,
        }
    }
}

/// Outcome of one task adaptation.
#[derive(Debug, Clone, PartialEq)]
pub struct Adaptation<P> {
    /// Parameters after the final step.
    pub params: P,
    /// Mean per-tensor gradient norm at each step.
    pub grad_norms: Vec<f64>,
    /// Training loss before each step.
    pub losses: Vec<f64>,
}

/// Gradient descent on a single task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InnerLoop {
    lr: f64,
    steps: usize,
    mode: AdaptationMode,
}

impl InnerLoop {
    /// Create an inner loop with step size `lr` and `steps` updates.
    #[must_use]
    pub const fn new(lr: f64, steps: usize, mode: AdaptationMode) -> Self {
        Self { lr, steps, mode }
    }

    /// Step size.
    #[must_use]
    pub const fn lr(&self) -> f64 {
        self.lr
    }

    /// Number of updates.
    #[must_use]
    pub const fn steps(&self) -> usize {
        self.steps
    }

    /// Gradient mode.
    #[must_use]
    pub const fn mode(&self) -> AdaptationMode {
        self.mode
    }

    /// Copy with a different step count.
    #[must_use]
    pub const fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Copy with a different mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: AdaptationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Adapt `theta` to one task, recording every step on `tape`.
    ///
    /// Step `k` evaluates the mean squared error at the current working
    /// parameters and sets `θ_{k+1} = θ_k - lr * ∇L(θ_k)`. `theta` itself is
    /// left untouched; with zero steps the returned parameters are `theta`.
    ///
    /// # Errors
    ///
    /// Returns an error if the function rejects the parameters or the inputs
    /// and targets have incompatible shapes.
    pub fn adapt<F>(
        &self,
        tape: &mut Tape,
        function: &F,
        theta: &TapeParams,
        inputs: Var,
        targets: Var,
    ) -> Result<Adaptation<TapeParams>>
    where
        F: AdaptableFunction + ?Sized,
    {
        let mut current = theta.clone();
        let mut grad_norms = Vec::with_capacity(self.steps);
        let mut losses = Vec::with_capacity(self.steps);

        for _ in 0..self.steps {
            let prediction = function.forward(tape, &current, inputs)?;
            let loss = tape.mse(prediction, targets)?;
            losses.push(tensor::item(tape.value(loss))?);

            let grads = grad(tape, loss, &current.to_vec(), self.mode.graph_mode())?;
            let grads = ParameterSet::from_ordered(grads, current.layout())?;
            grad_norms.push(mean_norm(tape, &grads)?);

            let lr = self.lr;
            current = current.try_zip_map(&grads, |&p, &g| {
                let step = tape.scale(g, -lr)?;
                tape.add(p, step)
            })?;
        }

        Ok(Adaptation {
            params: current,
            grad_norms,
            losses,
        })
    }

    /// Adapt parameter values on a private tape and return the values.
    ///
    /// # Errors
    ///
    /// See [`adapt`](Self::adapt).
    pub fn adapt_params<F>(
        &self,
        function: &F,
        params: &Params,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> Result<Adaptation<Params>>
    where
        F: AdaptableFunction + ?Sized,
    {
        let mut tape = Tape::new();
        let theta = params.register(&mut tape);
        let x = tape.constant(inputs.clone());
        let y = tape.constant(targets.clone());
        let adaptation = self.adapt(&mut tape, function, &theta, x, y)?;
        Ok(Adaptation {
            params: adaptation.params.values(&tape),
            grad_norms: adaptation.grad_norms,
            losses: adaptation.losses,
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean_norm(tape: &Tape, grads: &TapeParams) -> Result<f64> {
    let mut total = 0.0;
    for &g in grads.iter() {
        total += tensor::norm(tape.value(g))?;
    }
    Ok(total / grads.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::MlpFunction;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn linear_params(w: f64, b: f64) -> Params {
        ParameterSet::new(
            vec![tensor::from_vec(vec![w], &[1, 1]).unwrap()],
            vec![tensor::vector(vec![b]).unwrap()],
            tensor::zeros(&[0]).unwrap(),
        )
    }

    fn column(xs: Vec<f64>) -> Tensor {
        tensor::column(xs).unwrap()
    }

    fn first(t: &Tensor) -> f64 {
        tensor::to_vec(t).unwrap()[0]
    }

    #[test]
    fn test_zero_steps_is_identity() {
        let f = MlpFunction::new(1, 1, vec![8], 2);
        let params = f.init_params(&mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        let inner = InnerLoop::new(0.1, 0, AdaptationMode::SecondOrder);
        let x = column(vec![0.5, -0.5]);
        let adapted = inner.adapt_params(&f, &params, &x, &x).unwrap();
        assert_eq!(
            adapted.params.to_record().unwrap(),
            params.to_record().unwrap()
        );
        assert!(adapted.grad_norms.is_empty());
    }

    #[test]
    fn test_single_step_matches_manual_gradient() {
        // L = mean((w x + b - y)^2) at w = 0, b = 0, x = [1, 2], y = [2, 4]
        // dL/dw = mean(2 (0 - y) x) = -10, dL/db = mean(2 (0 - y)) = -6
        let f = MlpFunction::new(1, 1, vec![], 0);
        let inner = InnerLoop::new(0.1, 1, AdaptationMode::FirstOrder);
        let x = column(vec![1.0, 2.0]);
        let y = column(vec![2.0, 4.0]);
        let adapted = inner.adapt_params(&f, &linear_params(0.0, 0.0), &x, &y).unwrap();

        assert!((first(&adapted.params.weights()[0]) - 1.0).abs() < 1e-12);
        assert!((first(&adapted.params.biases()[0]) - 0.6).abs() < 1e-12);
        assert!((adapted.losses[0] - 10.0).abs() < 1e-12);
        // mean over (w, b, empty context) of |grad|
        assert!((adapted.grad_norms[0] - 16.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_steps_iterate_from_current_parameters() {
        let f = MlpFunction::new(1, 1, vec![], 0);
        let x = column(vec![1.0, 2.0]);
        let y = column(vec![2.0, 4.0]);
        let one = InnerLoop::new(0.1, 1, AdaptationMode::FirstOrder);
        let start = linear_params(0.0, 0.0);

        let twice = one.adapt_params(&f, &start, &x, &y).unwrap().params;
        let twice = one.adapt_params(&f, &twice, &x, &y).unwrap().params;
        let direct = one.with_steps(2).adapt_params(&f, &start, &x, &y).unwrap();

        assert_eq!(direct.losses.len(), 2);
        assert!(direct.losses[1] < direct.losses[0]);
        let direct = direct.params.to_record().unwrap();
        let twice = twice.to_record().unwrap();
        for (a, b) in direct.iter().zip(twice.iter()) {
            for (u, v) in a.data.iter().zip(&b.data) {
                assert!((u - v).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_second_order_keeps_graph() {
        let f = MlpFunction::new(1, 1, vec![], 0);
        let mut tape = Tape::new();
        let theta = linear_params(0.5, 0.0).register(&mut tape);
        let x = tape.constant(column(vec![1.0]));
        let y = tape.constant(column(vec![1.0]));

        let second = InnerLoop::new(0.1, 1, AdaptationMode::SecondOrder)
            .adapt(&mut tape, &f, &theta, x, y)
            .unwrap();
        let first = InnerLoop::new(0.1, 1, AdaptationMode::FirstOrder)
            .adapt(&mut tape, &f, &theta, x, y)
            .unwrap();

        assert_eq!(
            second.params.values(&tape).to_record().unwrap(),
            first.params.values(&tape).to_record().unwrap()
        );
        assert!(second.params.iter().all(|&v| tape.requires_grad(v)));
    }

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(AdaptationMode::from_first_order(true), AdaptationMode::FirstOrder);
        assert_eq!(AdaptationMode::from_first_order(false), AdaptationMode::SecondOrder);
    }
}
