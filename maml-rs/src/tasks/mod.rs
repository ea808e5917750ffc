//! Task families.
//!
//! A [`TaskFamily`] is a distribution over regression tasks that share an
//! input domain. Sampling draws from an explicitly passed RNG so a run is
//! reproducible from its seed alone.

mod linear;
mod sine;

pub use linear::{LinearTask, LinearTaskFamily};
pub use sine::{SineTask, SineTaskFamily};

use rand::{Rng, RngCore};

use crate::error::{MamlError, Result};
use crate::tensor::{self, Tensor};

/// A single regression target function.
pub trait Task: Send + Sync {
    /// Targets for an input batch of shape `[n, num_inputs]`.
    ///
    /// # Errors
    ///
    /// Returns an error if `inputs` has the wrong shape.
    fn targets(&self, inputs: &Tensor) -> Result<Tensor>;
}

impl<F> Task for F
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync,
{
    fn targets(&self, inputs: &Tensor) -> Result<Tensor> {
        self(inputs)
    }
}

/// Owned, type-erased task.
pub type BoxedTask = Box<dyn Task>;

/// Producer of tasks and input batches.
pub trait TaskFamily: Send + Sync {
    /// Task identity, e.g. `"sine"`.
    fn name(&self) -> &str;

    /// Input features per example.
    fn num_inputs(&self) -> usize;

    /// Output features per example.
    fn num_outputs(&self) -> usize;

    /// Draw one task.
    fn sample_task(&self, rng: &mut dyn RngCore) -> BoxedTask;

    /// Draw `count` independent tasks.
    fn sample_tasks(&self, count: usize, rng: &mut dyn RngCore) -> Vec<BoxedTask> {
        (0..count).map(|_| self.sample_task(rng)).collect()
    }

    /// Draw `k` inputs of shape `[k, num_inputs]`.
    ///
    /// With `order_inputs` set, rows come back in ascending order of their
    /// first feature.
    ///
    /// # Errors
    ///
    /// Returns an error if the input tensor cannot be built.
    fn sample_inputs(
        &self,
        k: usize,
        order_inputs: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor>;

    /// Inputs covering the whole domain, used to score an adapted task.
    ///
    /// # Errors
    ///
    /// Returns an error if the input tensor cannot be built.
    fn input_range(&self) -> Result<Tensor>;
}

/// Train, validation and test families for one task identity.
pub struct TaskFamilies {
    /// Tasks used for meta-updates.
    pub train: Box<dyn TaskFamily>,
    /// Tasks used for model selection.
    pub valid: Box<dyn TaskFamily>,
    /// Tasks used for reporting.
    pub test: Box<dyn TaskFamily>,
}

impl std::fmt::Debug for TaskFamilies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFamilies")
            .field("task", &self.train.name())
            .finish_non_exhaustive()
    }
}

/// Build the task families for `task`.
///
/// # Errors
///
/// Returns [`MamlError::UnsupportedTask`] for unknown identities.
pub fn task_families(task: &str) -> Result<TaskFamilies> {
    match task {
        "sine" => Ok(TaskFamilies {
            train: Box::new(SineTaskFamily::new()),
            valid: Box::new(SineTaskFamily::new()),
            test: Box::new(SineTaskFamily::new()),
        }),
        "linear" => Ok(TaskFamilies {
            train: Box::new(LinearTaskFamily::new()),
            valid: Box::new(LinearTaskFamily::new()),
            test: Box::new(LinearTaskFamily::new()),
        }),
        other => Err(MamlError::UnsupportedTask(other.to_string())),
    }
}

/// `k` scalar inputs from `U(low, high)` as a `[k, 1]` column.
pub(crate) fn uniform_column(
    k: usize,
    low: f64,
    high: f64,
    order_inputs: bool,
    rng: &mut dyn RngCore,
) -> Result<Tensor> {
    let mut xs: Vec<f64> = if low < high {
        (0..k).map(|_| rng.gen_range(low..high)).collect()
    } else {
        vec![low; k]
    };
    if order_inputs {
        xs.sort_by(f64::total_cmp);
    }
    tensor::column(xs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_known_families() {
        let families = task_families("sine").unwrap();
        assert_eq!(families.train.name(), "sine");
        assert_eq!(families.test.num_outputs(), 1);
        assert_eq!(task_families("linear").unwrap().valid.name(), "linear");
    }

    #[test]
    fn test_unknown_family() {
        assert!(matches!(
            task_families("celeba"),
            Err(MamlError::UnsupportedTask(t)) if t == "celeba"
        ));
    }

    #[test]
    fn test_closure_is_a_task() {
        let double = |x: &Tensor| -> Result<Tensor> { Ok(x.affine(2.0, 0.0)?) };
        let task: BoxedTask = Box::new(double);
        let y = task.targets(&tensor::column(vec![1.0, 2.0]).unwrap()).unwrap();
        assert_eq!(tensor::to_vec(&y).unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_sample_tasks_count() {
        let family = SineTaskFamily::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(family.sample_tasks(7, &mut rng).len(), 7);
        assert!(family.sample_tasks(0, &mut rng).is_empty());
    }

    #[test]
    fn test_ordered_inputs_are_sorted() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let xs = uniform_column(20, -1.0, 1.0, true, &mut rng).unwrap();
        assert_eq!(xs.dims(), &[20, 1]);
        let xs = tensor::to_vec(&xs).unwrap();
        assert!(xs.windows(2).all(|w| w[0] <= w[1]));
    }
}
