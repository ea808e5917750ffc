// Wengert tape: reverse-mode AD via operation recording.
//
// Every forward op appends one node holding its value as a candle tensor;
// candle computes the kernels, the tape owns the graph. Backward passes
// (see backward.rs) append more nodes to the same tape, so a gradient is an
// ordinary node and can itself be differentiated.

use crate::error::{MamlError, Result};
use crate::tensor::{self, Tensor};

// ── Handles ──────────────────────────────────────────────────────────

/// Handle to a node on a [`Tape`].
///
/// A `Var` is only meaningful for the tape that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(usize);

impl Var {
    /// Position of the node on its tape.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    /// Parameter or constant; no inputs.
    Leaf,

    // ── Linear algebra ──────────────────────────────────────────
    /// out = A @ B where A: [m, k], B: [k, n]
    MatMul { a: Var, b: Var },
    /// out = A^T
    Transpose { a: Var },

    // ── Element-wise ────────────────────────────────────────────
    /// out = A + B
    Add { a: Var, b: Var },
    /// out = A * B
    Mul { a: Var, b: Var },
    /// out = factor * A
    Scale { a: Var, factor: f64 },
    /// out = max(A, 0)
    Relu { a: Var },

    // ── Broadcast / reduce ──────────────────────────────────────
    /// out[i, :] = a for i in 0..rows; a: [n]
    BroadcastRows { a: Var },
    /// out = sum over rows; a: [m, n], out: [n]
    SumRows { a: Var },
    /// out = sum of all elements; out: [1]
    SumAll { a: Var },
    /// out = a repeated to `shape`; a: [1]
    Expand { a: Var },

    // ── Concat / slice ──────────────────────────────────────────
    /// out = [A | B] along columns
    ConcatCols { a: Var, b: Var },
    /// out = A[:, start..start + len]
    SliceCols { a: Var, start: usize, len: usize },
}

impl Op {
    fn inputs(&self) -> [Option<Var>; 2] {
        match *self {
            Op::Leaf => [None, None],
            Op::MatMul { a, b } | Op::Add { a, b } | Op::Mul { a, b } | Op::ConcatCols { a, b } => {
                [Some(a), Some(b)]
            }
            Op::Transpose { a }
            | Op::Scale { a, .. }
            | Op::Relu { a }
            | Op::BroadcastRows { a }
            | Op::SumRows { a }
            | Op::SumAll { a }
            | Op::Expand { a }
            | Op::SliceCols { a, .. } => [Some(a), None],
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) op: Op,
    pub(crate) value: Tensor,
    /// True iff the node depends on at least one parameter leaf.
    pub(crate) requires_grad: bool,
}

// ── Tape ─────────────────────────────────────────────────────────────

/// Arena of recorded operations.
///
/// Nodes are never removed; a tape lives for one task's adaptation and is
/// dropped afterwards.
#[derive(Debug, Default, Clone)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    /// Create an empty tape.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Forward value of a node.
    #[must_use]
    pub fn value(&self, var: Var) -> &Tensor {
        &self.nodes[var.0].value
    }

    /// Whether gradients flow through `var`.
    #[must_use]
    pub fn requires_grad(&self, var: Var) -> bool {
        self.nodes[var.0].requires_grad
    }

    pub(crate) fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// Record a differentiable leaf.
    pub fn parameter(&mut self, value: Tensor) -> Var {
        self.push_leaf(value, true)
    }

    /// Record a constant leaf.
    pub fn constant(&mut self, value: Tensor) -> Var {
        self.push_leaf(value, false)
    }

    /// Copy the value of `var` into a new constant, cutting its history.
    pub fn detach(&mut self, var: Var) -> Var {
        let value = self.value(var).clone();
        self.constant(value)
    }

    fn push_leaf(&mut self, value: Tensor, requires_grad: bool) -> Var {
        self.nodes.push(Node {
            op: Op::Leaf,
            value,
            requires_grad,
        });
        Var(self.nodes.len() - 1)
    }

    fn push(&mut self, op: Op, value: Tensor) -> Var {
        let requires_grad = op
            .inputs()
            .iter()
            .flatten()
            .any(|v| self.nodes[v.0].requires_grad);
        self.nodes.push(Node {
            op,
            value,
            requires_grad,
        });
        Var(self.nodes.len() - 1)
    }

    // ── Linear algebra ──────────────────────────────────────────

    /// Matrix product.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] on incompatible operands.
    pub fn matmul(&mut self, a: Var, b: Var) -> Result<Var> {
        let (m, k) = tensor::dims2("matmul", self.value(a))?;
        let (k2, n) = tensor::dims2("matmul", self.value(b))?;
        if k != k2 {
            return Err(MamlError::ShapeMismatch {
                op: "matmul",
                lhs: vec![m, k],
                rhs: vec![k2, n],
            });
        }
        let value = self.value(a).matmul(self.value(b))?;
        Ok(self.push(Op::MatMul { a, b }, value))
    }

    /// Transpose of a 2-D node.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if `a` is not 2-D.
    pub fn transpose(&mut self, a: Var) -> Result<Var> {
        tensor::dims2("transpose", self.value(a))?;
        let value = self.value(a).t()?.contiguous()?;
        Ok(self.push(Op::Transpose { a }, value))
    }

    // ── Element-wise ────────────────────────────────────────────

    /// Element-wise sum of same-shaped nodes.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if the shapes differ.
    pub fn add(&mut self, a: Var, b: Var) -> Result<Var> {
        tensor::expect_same_shape("add", self.value(a), self.value(b))?;
        let value = self.value(a).add(self.value(b))?;
        Ok(self.push(Op::Add { a, b }, value))
    }

    /// Element-wise difference `a - b`.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if the shapes differ.
    pub fn sub(&mut self, a: Var, b: Var) -> Result<Var> {
        tensor::expect_same_shape("sub", self.value(a), self.value(b))?;
        let neg = self.scale(b, -1.0)?;
        self.add(a, neg)
    }

    /// Element-wise product of same-shaped nodes.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if the shapes differ.
    pub fn mul(&mut self, a: Var, b: Var) -> Result<Var> {
        tensor::expect_same_shape("mul", self.value(a), self.value(b))?;
        let value = self.value(a).mul(self.value(b))?;
        Ok(self.push(Op::Mul { a, b }, value))
    }

    /// Multiply by a constant factor.
    ///
    /// # Errors
    ///
    /// Returns an error if the candle kernel fails.
    pub fn scale(&mut self, a: Var, factor: f64) -> Result<Var> {
        let value = self.value(a).affine(factor, 0.0)?;
        Ok(self.push(Op::Scale { a, factor }, value))
    }

    /// Rectified linear unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the candle kernel fails.
    pub fn relu(&mut self, a: Var) -> Result<Var> {
        let value = self.value(a).relu()?;
        Ok(self.push(Op::Relu { a }, value))
    }

    // ── Broadcast / reduce ──────────────────────────────────────

    /// Repeat a 1-D node as `rows` rows.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if `a` is not 1-D.
    pub fn broadcast_rows(&mut self, a: Var, rows: usize) -> Result<Var> {
        let n = tensor::dims1("broadcast_rows", self.value(a))?;
        let value = self.value(a).broadcast_as((rows, n))?.contiguous()?;
        Ok(self.push(Op::BroadcastRows { a }, value))
    }

    /// Sum a 2-D node over its rows.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if `a` is not 2-D.
    pub fn sum_rows(&mut self, a: Var) -> Result<Var> {
        tensor::dims2("sum_rows", self.value(a))?;
        let value = self.value(a).sum(0)?;
        Ok(self.push(Op::SumRows { a }, value))
    }

    /// Sum of every element, as a `[1]` node.
    ///
    /// # Errors
    ///
    /// Returns an error if the candle kernel fails.
    pub fn sum_all(&mut self, a: Var) -> Result<Var> {
        let value = self.value(a).sum_all()?.reshape(1)?;
        Ok(self.push(Op::SumAll { a }, value))
    }

    /// Repeat a `[1]` node to `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if `a` does not have shape `[1]`.
    pub fn expand(&mut self, a: Var, shape: &[usize]) -> Result<Var> {
        let source = self.value(a);
        if source.dims() != [1] {
            return Err(MamlError::ShapeMismatch {
                op: "expand",
                lhs: vec![1],
                rhs: source.dims().to_vec(),
            });
        }
        let value = source.broadcast_as(shape)?.contiguous()?;
        Ok(self.push(Op::Expand { a }, value))
    }

    // ── Concat / slice ──────────────────────────────────────────

    /// Concatenate two 2-D nodes along columns.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if the row counts differ.
    pub fn concat_cols(&mut self, a: Var, b: Var) -> Result<Var> {
        let (m, p) = tensor::dims2("concat_cols", self.value(a))?;
        let (m2, q) = tensor::dims2("concat_cols", self.value(b))?;
        if m != m2 {
            return Err(MamlError::ShapeMismatch {
                op: "concat_cols",
                lhs: vec![m, p],
                rhs: vec![m2, q],
            });
        }
        let value = Tensor::cat(&[self.value(a), self.value(b)], 1)?;
        Ok(self.push(Op::ConcatCols { a, b }, value))
    }

    /// Column range of a 2-D node.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if the range is out of bounds.
    pub fn slice_cols(&mut self, a: Var, start: usize, len: usize) -> Result<Var> {
        let (m, n) = tensor::dims2("slice_cols", self.value(a))?;
        if start + len > n {
            return Err(MamlError::ShapeMismatch {
                op: "slice_cols",
                lhs: vec![m, n],
                rhs: vec![start, start + len],
            });
        }
        let value = self.value(a).narrow(1, start, len)?.contiguous()?;
        Ok(self.push(Op::SliceCols { a, start, len }, value))
    }

    // ── Losses ──────────────────────────────────────────────────

    /// Mean squared error between two same-shaped nodes, as a `[1]` node.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if the shapes differ or are empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn mse(&mut self, prediction: Var, target: Var) -> Result<Var> {
        let numel = self.value(prediction).elem_count();
        if numel == 0 {
            return Err(MamlError::ShapeMismatch {
                op: "mse",
                lhs: self.value(prediction).dims().to_vec(),
                rhs: self.value(target).dims().to_vec(),
            });
        }
        let diff = self.sub(prediction, target)?;
        let squared = self.mul(diff, diff)?;
        let total = self.sum_all(squared)?;
        self.scale(total, 1.0 / numel as f64)
    }
}
