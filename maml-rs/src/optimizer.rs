//! Outer-loop optimizer (Adam via candle's AdamW).

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::error::{MamlError, Result};
use crate::params::{GradientVector, Layout, Params};

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl AdamConfig {
    /// Set the learning rate.
    #[must_use]
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Build an optimizer with these parameters.
    #[must_use]
    pub fn build(self) -> AdamWOptimizer {
        AdamWOptimizer::new(self)
    }

    /// AdamW parameters with weight decay disabled, which is plain Adam.
    #[must_use]
    pub fn adamw_params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: 0.0,
        }
    }
}

/// Adam over a [`Params`] set, driven by [`candle_nn::AdamW`].
///
/// The candle optimizer and its moment state are created on the first step
/// with the structure of the parameters it updates. Each step copies the
/// parameter values into candle variables, hands the meta-gradient to AdamW
/// as a [`GradStore`], and copies the updated values back.
pub struct AdamWOptimizer {
    config: AdamConfig,
    steps: u64,
    state: Option<AdamState>,
}

struct AdamState {
    inner: candle_nn::AdamW,
    layout: Layout,
    shapes: Vec<Vec<usize>>,
    /// One slot per tensor in canonical order; empty tensors have none.
    vars: Vec<Option<Var>>,
}

impl AdamState {
    fn new(params: &Params, config: &AdamConfig) -> Result<Self> {
        let vars = params
            .iter()
            .map(|t| -> Result<Option<Var>> {
                if t.elem_count() == 0 {
                    Ok(None)
                } else {
                    Ok(Some(Var::from_tensor(t)?))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let tracked = vars.iter().flatten().cloned().collect();
        let inner = candle_nn::AdamW::new(tracked, config.adamw_params())?;
        Ok(Self {
            inner,
            layout: params.layout(),
            shapes: params.iter().map(|t| t.dims().to_vec()).collect(),
            vars,
        })
    }

    fn check_matches(&self, params: &Params) -> Result<()> {
        if params.layout() != self.layout {
            return Err(MamlError::ParameterCountMismatch {
                expected: self.layout.len(),
                actual: params.len(),
            });
        }
        for (shape, p) in self.shapes.iter().zip(params.iter()) {
            if shape.as_slice() != p.dims() {
                return Err(MamlError::ShapeMismatch {
                    op: "adam",
                    lhs: shape.clone(),
                    rhs: p.dims().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Gradient store whose entry for every variable is its tensor in
    /// `grads`, obtained by differentiating `sum_i <var_i, grad_i>`.
    fn grad_store(&self, grads: &GradientVector) -> Result<Option<GradStore>> {
        let mut surrogate: Option<Tensor> = None;
        for (var, g) in self.vars.iter().zip(grads.iter()) {
            let Some(var) = var else { continue };
            let term = var.as_tensor().mul(g)?.sum_all()?;
            surrogate = Some(match surrogate {
                Some(total) => total.add(&term)?,
                None => term,
            });
        }
        surrogate.map(|s| s.backward()).transpose().map_err(Into::into)
    }

    fn apply(&mut self, params: &mut Params, grads: &GradientVector) -> Result<()> {
        for (var, p) in self.vars.iter().zip(params.iter()) {
            if let Some(var) = var {
                var.set(p)?;
            }
        }
        let Some(store) = self.grad_store(grads)? else {
            return Ok(());
        };
        self.inner.step(&store)?;

        let mut updated = Vec::with_capacity(self.vars.len());
        for var in &self.vars {
            updated.push(match var {
                Some(var) => Some(var.as_tensor().copy()?),
                None => None,
            });
        }
        for (p, value) in params.iter_mut().zip(updated) {
            if let Some(value) = value {
                *p = value;
            }
        }
        Ok(())
    }
}

impl AdamWOptimizer {
    /// Create an optimizer with no moment history.
    #[must_use]
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            steps: 0,
            state: None,
        }
    }

    /// Apply one update to `params` in place.
    ///
    /// # Errors
    ///
    /// Returns an error if `grads` does not match the structure of `params`
    /// or of the moment state; `params` is left unchanged in that case.
    pub fn step(&mut self, params: &mut Params, grads: &GradientVector) -> Result<()> {
        params.check_same_shapes(grads, "adam")?;
        if let Some(state) = &self.state {
            state.check_matches(params)?;
        } else {
            self.state = Some(AdamState::new(params, &self.config)?);
        }
        if let Some(state) = self.state.as_mut() {
            state.apply(params, grads)?;
        }
        self.steps += 1;
        Ok(())
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
        if let Some(state) = self.state.as_mut() {
            state.inner.set_learning_rate(lr);
        }
    }

    /// Number of updates applied.
    #[must_use]
    pub fn steps_taken(&self) -> u64 {
        self.steps
    }

    /// Hyperparameters.
    #[must_use]
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }
}

impl std::fmt::Debug for AdamWOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdamWOptimizer")
            .field("config", &self.config)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}
