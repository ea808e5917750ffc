//! Linear regression through the origin: `y = slope * x`.

use rand::{Rng, RngCore};

use super::{uniform_column, BoxedTask, Task, TaskFamily};
use crate::error::Result;
use crate::tensor::{self, Tensor};

const SLOPE_RANGE: (f64, f64) = (-2.0, 2.0);
const INPUT_RANGE: (f64, f64) = (-1.0, 1.0);
const RANGE_POINTS: usize = 50;

/// One line through the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTask {
    slope: f64,
}

impl LinearTask {
    /// A line with the given slope.
    #[must_use]
    pub fn new(slope: f64) -> Self {
        Self { slope }
    }

    /// Slope.
    #[must_use]
    pub fn slope(&self) -> f64 {
        self.slope
    }
}

impl Task for LinearTask {
    fn targets(&self, inputs: &Tensor) -> Result<Tensor> {
        Ok(inputs.affine(self.slope, 0.0)?)
    }
}

/// Lines with slope in `[-2, 2]` and inputs in `[-1, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearTaskFamily;

impl LinearTaskFamily {
    /// Create the family.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TaskFamily for LinearTaskFamily {
    fn name(&self) -> &str {
        "linear"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn sample_task(&self, rng: &mut dyn RngCore) -> BoxedTask {
        Box::new(LinearTask::new(rng.gen_range(SLOPE_RANGE.0..SLOPE_RANGE.1)))
    }

    fn sample_inputs(
        &self,
        k: usize,
        order_inputs: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor> {
        uniform_column(k, INPUT_RANGE.0, INPUT_RANGE.1, order_inputs, rng)
    }

    fn input_range(&self) -> Result<Tensor> {
        tensor::linspace(INPUT_RANGE.0, INPUT_RANGE.1, RANGE_POINTS)
    }
}
