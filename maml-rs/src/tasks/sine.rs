//! Sinusoid regression: `y = amplitude * sin(x - phase)`.

use std::f64::consts::PI;

use rand::{Rng, RngCore};

use super::{uniform_column, BoxedTask, Task, TaskFamily};
use crate::error::Result;
use crate::tensor::{self, Tensor};

const AMPLITUDE_RANGE: (f64, f64) = (0.1, 5.0);
const PHASE_RANGE: (f64, f64) = (0.0, PI);
const INPUT_RANGE: (f64, f64) = (-5.0, 5.0);
const RANGE_POINTS: usize = 100;

/// One sinusoid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineTask {
    amplitude: f64,
    phase: f64,
}

impl SineTask {
    /// A sinusoid with the given amplitude and phase.
    #[must_use]
    pub fn new(amplitude: f64, phase: f64) -> Self {
        Self { amplitude, phase }
    }

    /// Amplitude.
    #[must_use]
    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    /// Phase shift.
    #[must_use]
    pub fn phase(&self) -> f64 {
        self.phase
    }
}

impl Task for SineTask {
    fn targets(&self, inputs: &Tensor) -> Result<Tensor> {
        Ok(inputs
            .affine(1.0, -self.phase)?
            .sin()?
            .affine(self.amplitude, 0.0)?)
    }
}

/// Sinusoids with amplitude in `[0.1, 5]`, phase in `[0, π]` and inputs in
/// `[-5, 5]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SineTaskFamily;

impl SineTaskFamily {
    /// Create the family.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TaskFamily for SineTaskFamily {
    fn name(&self) -> &str {
        "sine"
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn sample_task(&self, rng: &mut dyn RngCore) -> BoxedTask {
        let amplitude = rng.gen_range(AMPLITUDE_RANGE.0..AMPLITUDE_RANGE.1);
        let phase = rng.gen_range(PHASE_RANGE.0..PHASE_RANGE.1);
        Box::new(SineTask::new(amplitude, phase))
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_targets() {
        let task = SineTask::new(2.0, PI / 2.0);
        let x = tensor::column(vec![PI / 2.0, PI]).unwrap();
        let y = tensor::to_vec(&task.targets(&x).unwrap()).unwrap();
        assert!(y[0].abs() < 1e-12);
        assert!((y[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_inputs_within_domain() {
        let family = SineTaskFamily::new();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let xs = family.sample_inputs(50, false, &mut rng).unwrap();
        assert_eq!(xs.dims(), &[50, 1]);
        assert!(tensor::to_vec(&xs).unwrap().iter().all(|x| (-5.0..5.0).contains(x)));
    }

    #[test]
    fn test_sampled_targets_bounded_by_amplitude() {
        let family = SineTaskFamily::new();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let range = family.input_range().unwrap();
        assert_eq!(range.dims(), &[100, 1]);
        for task in family.sample_tasks(20, &mut rng) {
            let y = tensor::to_vec(&task.targets(&range).unwrap()).unwrap();
            assert!(y.iter().all(|v| v.abs() <= 5.0));
        }
    }

    #[test]
    fn test_same_seed_same_tasks() {
        let family = SineTaskFamily::new();
        let range = family.input_range().unwrap();
        let a = family.sample_task(&mut ChaCha8Rng::seed_from_u64(9));
        let b = family.sample_task(&mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(
            tensor::to_vec(&a.targets(&range).unwrap()).unwrap(),
            tensor::to_vec(&b.targets(&range).unwrap()).unwrap()
        );
    }
}
