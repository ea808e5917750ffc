//! Construction and read-back of `f64` tensors.
//!
//! Every value in the crate is a [`candle_core::Tensor`] of dtype
//! [`DType::F64`] on the CPU. The helpers here build such tensors from plain
//! data, read them back, and report bad shapes as
//! [`MamlError::ShapeMismatch`] before candle sees them.
//!
//! Candle tensors carry neither equality nor serde support, so comparisons and
//! persistence go through the plain-data [`TensorRecord`].

use candle_core::{DType, Device};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub use candle_core::Tensor;

use crate::error::{MamlError, Result};

/// Element type of every tensor in the crate.
pub const DTYPE: DType = DType::F64;

/// Tensor with the given shape from flat row-major data.
///
/// # Errors
///
/// Returns [`MamlError::ShapeMismatch`] if the element count does not match
/// the shape.
pub fn from_vec(data: Vec<f64>, shape: &[usize]) -> Result<Tensor> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(MamlError::ShapeMismatch {
            op: "from_vec",
            lhs: shape.to_vec(),
            rhs: vec![data.len()],
        });
    }
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

/// 1-D tensor of shape `[n]`.
///
/// # Errors
///
/// Returns an error if candle cannot allocate the tensor.
pub fn vector(data: Vec<f64>) -> Result<Tensor> {
    let n = data.len();
    from_vec(data, &[n])
}

/// Column batch of shape `[n, 1]`, one scalar input per row.
///
/// # Errors
///
/// Returns an error if candle cannot allocate the tensor.
pub fn column(data: Vec<f64>) -> Result<Tensor> {
    let n = data.len();
    from_vec(data, &[n, 1])
}

/// Single-element tensor of shape `[1]`.
///
/// # Errors
///
/// Returns an error if candle cannot allocate the tensor.
pub fn scalar(value: f64) -> Result<Tensor> {
    from_vec(vec![value], &[1])
}

/// All-zero tensor.
///
/// # Errors
///
/// Returns an error if candle cannot allocate the tensor.
pub fn zeros(shape: &[usize]) -> Result<Tensor> {
    Ok(Tensor::zeros(shape, DTYPE, &Device::Cpu)?)
}

/// All-one tensor.
///
/// # Errors
///
/// Returns an error if candle cannot allocate the tensor.
pub fn ones(shape: &[usize]) -> Result<Tensor> {
    Ok(Tensor::ones(shape, DTYPE, &Device::Cpu)?)
}

/// `n` evenly spaced points on `[start, end]` as an `[n, 1]` column.
///
/// # Errors
///
/// Returns an error if candle cannot allocate the tensor.
#[allow(clippy::cast_precision_loss)]
pub fn linspace(start: f64, end: f64, n: usize) -> Result<Tensor> {
    let data = match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    };
    column(data)
}

/// Tensor filled from `U(low, high)`, drawn in row-major order.
///
/// # Errors
///
/// Returns an error if candle cannot allocate the tensor.
pub fn uniform<R: Rng + ?Sized>(shape: &[usize], low: f64, high: f64, rng: &mut R) -> Result<Tensor> {
    let numel = shape.iter().product();
    let data = if low < high {
        (0..numel).map(|_| rng.gen_range(low..high)).collect()
    } else {
        vec![low; numel]
    };
    from_vec(data, shape)
}

/// Flat row-major copy of the elements.
///
/// # Errors
///
/// Returns an error if the tensor is not `f64`.
pub fn to_vec(tensor: &Tensor) -> Result<Vec<f64>> {
    Ok(tensor.flatten_all()?.to_vec1::<f64>()?)
}

/// Value of a single-element tensor.
///
/// # Errors
///
/// Returns [`MamlError::NonScalarOutput`] if the tensor holds more or fewer
/// than one element.
pub fn item(tensor: &Tensor) -> Result<f64> {
    match to_vec(tensor)?.as_slice() {
        [v] => Ok(*v),
        _ => Err(MamlError::NonScalarOutput(tensor.dims().to_vec())),
    }
}

/// Mean squared error between same-shaped tensors.
///
/// # Errors
///
/// Returns [`MamlError::ShapeMismatch`] if the shapes differ or the tensors
/// are empty.
pub fn mse(prediction: &Tensor, target: &Tensor) -> Result<f64> {
    expect_same_shape("mse", prediction, target)?;
    if prediction.elem_count() == 0 {
        return Err(MamlError::ShapeMismatch {
            op: "mse",
            lhs: prediction.dims().to_vec(),
            rhs: target.dims().to_vec(),
        });
    }
    Ok(prediction.sub(target)?.sqr()?.mean_all()?.to_scalar::<f64>()?)
}

/// Euclidean norm of all elements; zero for an empty tensor.
///
/// # Errors
///
/// Returns an error if the tensor is not `f64`.
pub fn norm(tensor: &Tensor) -> Result<f64> {
    if tensor.elem_count() == 0 {
        return Ok(0.0);
    }
    Ok(tensor.sqr()?.sum_all()?.to_scalar::<f64>()?.sqrt())
}

pub(crate) fn expect_same_shape(op: &'static str, lhs: &Tensor, rhs: &Tensor) -> Result<()> {
    if lhs.dims() == rhs.dims() {
        Ok(())
    } else {
        Err(MamlError::ShapeMismatch {
            op,
            lhs: lhs.dims().to_vec(),
            rhs: rhs.dims().to_vec(),
        })
    }
}

pub(crate) fn dims1(op: &'static str, tensor: &Tensor) -> Result<usize> {
    match tensor.dims() {
        [n] => Ok(*n),
        other => Err(MamlError::ShapeMismatch {
            op,
            lhs: vec![0],
            rhs: other.to_vec(),
        }),
    }
}

pub(crate) fn dims2(op: &'static str, tensor: &Tensor) -> Result<(usize, usize)> {
    match tensor.dims() {
        [m, n] => Ok((*m, *n)),
        other => Err(MamlError::ShapeMismatch {
            op,
            lhs: vec![0, 0],
            rhs: other.to_vec(),
        }),
    }
}

/// Plain-data copy of a tensor, used for comparison and persistence.
///
/// Non-finite elements survive a JSON round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Flat row-major elements.
    #[serde(with = "crate::nonfinite::vec")]
    pub data: Vec<f64>,
}

impl TensorRecord {
    /// Snapshot of `tensor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not `f64`.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: to_vec(tensor)?,
        })
    }

    /// Rebuild the tensor.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::ShapeMismatch`] if `data` does not fill `shape`.
    pub fn to_tensor(&self) -> Result<Tensor> {
        from_vec(self.data.clone(), &self.shape)
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}
