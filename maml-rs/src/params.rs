//! Ordered parameter sets.
//!
//! A [`ParameterSet`] holds the weights, the biases and the context vector of
//! an adaptable function. Its canonical order is every weight tensor in layer
//! order, then every bias tensor in layer order, then the single context
//! tensor. Gradient vectors and optimizer state use the same type, so the
//! index of a parameter and the index of its gradient can never diverge.

use serde::{Deserialize, Serialize};

use crate::autodiff::{Tape, Var};
use crate::error::{MamlError, Result};
use crate::tensor::{self, Tensor, TensorRecord};

/// Weights, biases and context of one adaptable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet<T> {
    weights: Vec<T>,
    biases: Vec<T>,
    context: T,
}

/// Parameter values.
pub type Params = ParameterSet<Tensor>;

/// A gradient with the same structure as the parameters it belongs to.
pub type GradientVector = ParameterSet<Tensor>;

/// Parameters registered on a [`Tape`].
pub type TapeParams = ParameterSet<Var>;

/// Plain-data parameter snapshot; the stored form of a [`Params`].
pub type ParamsRecord = ParameterSet<TensorRecord>;

/// Number of weight and bias tensors in a [`ParameterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Number of weight tensors.
    pub weights: usize,
    /// Number of bias tensors.
    pub biases: usize,
}

impl Layout {
    /// Total number of tensors, context included.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.weights + self.biases + 1
    }

    /// Always false; the context slot is present even when empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Addresses one tensor of a [`ParameterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSlot {
    /// Weight tensor of the given layer.
    Weight(usize),
    /// Bias tensor of the given layer.
    Bias(usize),
    /// The context vector.
    Context,
}

impl<T> ParameterSet<T> {
    /// Assemble a parameter set.
    pub fn new(weights: Vec<T>, biases: Vec<T>, context: T) -> Self {
        Self {
            weights,
            biases,
            context,
        }
    }

    /// Weight tensors in layer order.
    #[must_use]
    pub fn weights(&self) -> &[T] {
        &self.weights
    }

    /// Bias tensors in layer order.
    #[must_use]
    pub fn biases(&self) -> &[T] {
        &self.biases
    }

    /// The context vector.
    #[must_use]
    pub fn context(&self) -> &T {
        &self.context
    }

    /// Entry at `slot`, if it exists.
    #[must_use]
    pub fn get(&self, slot: ParamSlot) -> Option<&T> {
        match slot {
            ParamSlot::Weight(i) => self.weights.get(i),
            ParamSlot::Bias(i) => self.biases.get(i),
            ParamSlot::Context => Some(&self.context),
        }
    }

    /// Mutable entry at `slot`, if it exists.
    pub fn get_mut(&mut self, slot: ParamSlot) -> Option<&mut T> {
        match slot {
            ParamSlot::Weight(i) => self.weights.get_mut(i),
            ParamSlot::Bias(i) => self.biases.get_mut(i),
            ParamSlot::Context => Some(&mut self.context),
        }
    }

    /// Structure of this set.
    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout {
            weights: self.weights.len(),
            biases: self.biases.len(),
        }
    }

    /// Number of tensors, `weights + biases + 1`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layout().len()
    }

    /// Always false; see [`Layout::is_empty`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Entries in canonical order: weights, biases, context.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.weights
            .iter()
            .chain(self.biases.iter())
            .chain(std::iter::once(&self.context))
    }

    /// Mutable entries in canonical order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.weights
            .iter_mut()
            .chain(self.biases.iter_mut())
            .chain(std::iter::once(&mut self.context))
    }

    /// Flatten into canonical order.
    #[must_use]
    pub fn into_ordered(self) -> Vec<T> {
        let mut out = self.weights;
        out.extend(self.biases);
        out.push(self.context);
        out
    }

    /// Rebuild a set from entries in canonical order.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ParameterCountMismatch`] if `items` does not have
    /// exactly `layout.len()` entries.
    pub fn from_ordered(items: Vec<T>, layout: Layout) -> Result<Self> {
        if items.len() != layout.len() {
            return Err(MamlError::ParameterCountMismatch {
                expected: layout.len(),
                actual: items.len(),
            });
        }
        let mut items = items.into_iter();
        let weights: Vec<T> = items.by_ref().take(layout.weights).collect();
        let biases: Vec<T> = items.by_ref().take(layout.biases).collect();
        let context = items.next().ok_or(MamlError::ParameterCountMismatch {
            expected: layout.len(),
            actual: layout.weights + layout.biases,
        })?;
        Ok(Self::new(weights, biases, context))
    }

    /// Apply `f` to every entry, keeping the structure.
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> ParameterSet<U> {
        ParameterSet {
            weights: self.weights.iter().map(&mut f).collect(),
            biases: self.biases.iter().map(&mut f).collect(),
            context: f(&self.context),
        }
    }

    /// Fallible [`map`](Self::map).
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map<U>(&self, mut f: impl FnMut(&T) -> Result<U>) -> Result<ParameterSet<U>> {
        Ok(ParameterSet {
            weights: self.weights.iter().map(&mut f).collect::<Result<_>>()?,
            biases: self.biases.iter().map(&mut f).collect::<Result<_>>()?,
            context: f(&self.context)?,
        })
    }

    /// Combine two sets entry by entry.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ParameterCountMismatch`] if the layouts differ, or
    /// the first error produced by `f`.
    pub fn try_zip_map<U, V>(
        &self,
        other: &ParameterSet<U>,
        mut f: impl FnMut(&T, &U) -> Result<V>,
    ) -> Result<ParameterSet<V>> {
        if self.layout() != other.layout() {
            return Err(MamlError::ParameterCountMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }
        let weights = self
            .weights
            .iter()
            .zip(&other.weights)
            .map(|(a, b)| f(a, b))
            .collect::<Result<_>>()?;
        let biases = self
            .biases
            .iter()
            .zip(&other.biases)
            .map(|(a, b)| f(a, b))
            .collect::<Result<_>>()?;
        let context = f(&self.context, &other.context)?;
        Ok(ParameterSet {
            weights,
            biases,
            context,
        })
    }
}

impl ParameterSet<Tensor> {
    /// Zero tensors with the same shapes.
    ///
    /// # Errors
    ///
    /// Returns an error if candle cannot allocate a tensor.
    pub fn zeros_like(&self) -> Result<Self> {
        self.try_map(|t| Ok(t.zeros_like()?))
    }

    /// Check that `other` has the same layout and tensor shapes.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ParameterCountMismatch`] if the layouts differ, or
    /// [`MamlError::ShapeMismatch`] naming `op` for the first tensor whose
    /// shape differs.
    pub fn check_same_shapes(&self, other: &Self, op: &'static str) -> Result<()> {
        if self.layout() != other.layout() {
            return Err(MamlError::ParameterCountMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }
        self.iter()
            .zip(other.iter())
            .try_for_each(|(a, b)| tensor::expect_same_shape(op, a, b))
    }

    /// In-place `self += other`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layouts or any tensor shapes differ; `self` is
    /// unchanged in that case.
    pub fn add_assign(&mut self, other: &Self) -> Result<()> {
        self.check_same_shapes(other, "add_assign")?;
        for (a, b) in self.iter_mut().zip(other.iter()) {
            *a = a.add(b)?;
        }
        Ok(())
    }

    /// In-place multiplication of every tensor by `factor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the candle kernel fails.
    pub fn scale_assign(&mut self, factor: f64) -> Result<()> {
        for t in self.iter_mut() {
            *t = t.affine(factor, 0.0)?;
        }
        Ok(())
    }

    /// Euclidean norm over every element of every tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor cannot be read back.
    pub fn norm(&self) -> Result<f64> {
        let squares = self
            .iter()
            .map(|t| tensor::norm(t).map(|n| n * n))
            .collect::<Result<Vec<_>>>()?;
        Ok(squares.iter().sum::<f64>().sqrt())
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.iter().map(Tensor::elem_count).sum()
    }

    /// Register every tensor as a differentiable leaf on `tape`.
    pub fn register(&self, tape: &mut Tape) -> TapeParams {
        self.map(|t| tape.parameter(t.clone()))
    }

    /// Register every tensor as a constant on `tape`.
    pub fn register_constants(&self, tape: &mut Tape) -> TapeParams {
        self.map(|t| tape.constant(t.clone()))
    }

    /// Plain-data snapshot for comparison and persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor cannot be read back.
    pub fn to_record(&self) -> Result<ParamsRecord> {
        self.try_map(TensorRecord::from_tensor)
    }
}

impl ParameterSet<TensorRecord> {
    /// Rebuild the tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if a record's data does not fill its shape.
    pub fn to_params(&self) -> Result<Params> {
        self.try_map(TensorRecord::to_tensor)
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.iter().map(TensorRecord::numel).sum()
    }
}

impl ParameterSet<Var> {
    /// Read the current values back from `tape`.
    #[must_use]
    pub fn values(&self, tape: &Tape) -> Params {
        self.map(|&v| tape.value(v).clone())
    }

    /// Handles in canonical order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Var> {
        self.iter().copied().collect()
    }
}
