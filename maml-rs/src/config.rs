//! Experiment configuration.
//!
//! A configuration file only needs the keys it changes: values are merged
//! over the canonical defaults of the configured `task`. Keys the defaults do
//! not know are kept in [`MamlConfig::extra`] and reported by
//! [`MamlConfig::unexpected_keys`] instead of failing the load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MamlError, Result};
use crate::optimizer::AdamConfig;

/// Task used when a configuration does not name one.
pub const DEFAULT_TASK: &str = "sine";

/// Full configuration of one meta-training run.
///
/// # Example
///
/// ```rust
/// use maml_rs::MamlConfig;
///
/// # fn main() -> maml_rs::Result<()> {
/// let config = MamlConfig::from_toml_str("task = \"linear\"\nn_iter = 10\n")?;
/// assert_eq!(config.n_iter, 10);
/// assert_eq!(config.tasks_per_metaupdate, 10);
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MamlConfig {
    /// Task family identity (`"sine"` or `"linear"`).
    pub task: String,

    /// Number of outer iterations.
    pub n_iter: usize,

    /// Tasks sampled per meta-update.
    pub tasks_per_metaupdate: usize,

    /// Inner-loop gradient steps.
    pub num_inner_updates: usize,

    /// Inner-loop step size.
    pub lr_inner: f64,

    /// Outer (Adam) learning rate.
    pub lr_meta: f64,

    /// Detach inner-loop gradients from the meta-graph.
    pub first_order: bool,

    /// Inputs per task used for adaptation during meta-training.
    pub k_meta_train: usize,

    /// Held-out inputs per task used for the meta-loss.
    pub k_meta_test: usize,

    /// Inputs per task used for adaptation during evaluation.
    pub k_shot_eval: usize,

    /// Tasks sampled per evaluation.
    pub n_eval_tasks: usize,

    /// Seed for every random draw in the run.
    pub seed: u64,

    /// Hidden-layer widths of the network.
    pub n_hidden: Vec<usize>,

    /// Length of the context vector.
    pub num_context_params: usize,

    /// Sort sampled inputs.
    pub order_pixels: bool,

    /// Adam first-moment decay.
    #[serde(default = "default_adam_beta1")]
    pub adam_beta1: f64,

    /// Adam second-moment decay.
    #[serde(default = "default_adam_beta2")]
    pub adam_beta2: f64,

    /// Adam epsilon.
    #[serde(default = "default_adam_eps")]
    pub adam_eps: f64,

    /// Keys not recognised by the defaults.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

fn default_adam_beta1() -> f64 {
    AdamConfig::default().beta1
}

fn default_adam_beta2() -> f64 {
    AdamConfig::default().beta2
}

fn default_adam_eps() -> f64 {
    AdamConfig::default().eps
}

impl MamlConfig {
    /// Canonical defaults for `task`.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::UnsupportedTask`] for unknown tasks.
    pub fn default_for(task: &str) -> Result<Self> {
        match task {
            "sine" => Ok(Self::sine_defaults()),
            "linear" => Ok(Self::linear_defaults()),
            other => Err(MamlError::UnsupportedTask(other.to_string())),
        }
    }

    /// Defaults for sinusoid regression.
    #[must_use]
    pub fn sine_defaults() -> Self {
        Self {
            task: "sine".into(),
            n_iter: 50_000,
            tasks_per_metaupdate: 25,
            num_inner_updates: 1,
            lr_inner: 0.01,
            lr_meta: 0.001,
            first_order: false,
            k_meta_train: 10,
            k_meta_test: 10,
            k_shot_eval: 10,
            n_eval_tasks: 100,
            seed: 42,
            n_hidden: vec![40, 40],
            num_context_params: 0,
            order_pixels: false,
            adam_beta1: default_adam_beta1(),
            adam_beta2: default_adam_beta2(),
            adam_eps: default_adam_eps(),
            extra: BTreeMap::new(),
        }
    }

    /// Defaults for the toy linear family.
    #[must_use]
    pub fn linear_defaults() -> Self {
        Self {
            task: "linear".into(),
            n_iter: 2_000,
            tasks_per_metaupdate: 10,
            n_hidden: Vec::new(),
            ..Self::sine_defaults()
        }
    }

    /// Parse TOML, filling missing keys from the task defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed, a value has the wrong type,
    /// or the task is unsupported.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let overrides: toml::Table = toml::from_str(content)?;
        let task = match overrides.get("task") {
            None => DEFAULT_TASK,
            Some(toml::Value::String(task)) => task.as_str(),
            Some(other) => {
                return Err(MamlError::Config(format!(
                    "task must be a string, got {}",
                    other.type_str()
                )))
            }
        };

        let mut merged = match toml::Value::try_from(Self::default_for(task)?)? {
            toml::Value::Table(table) => table,
            _ => return Err(MamlError::Config("defaults are not a table".into())),
        };
        merged.extend(overrides);
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MamlError::UnsupportedTask`] for unknown tasks and
    /// [`MamlError::Config`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        Self::default_for(&self.task)?;

        if self.tasks_per_metaupdate == 0 {
            return Err(MamlError::Config("tasks_per_metaupdate must be > 0".into()));
        }
        if self.lr_inner.is_nan() || self.lr_inner <= 0.0 {
            return Err(MamlError::Config("lr_inner must be > 0".into()));
        }
        if self.lr_meta.is_nan() || self.lr_meta <= 0.0 {
            return Err(MamlError::Config("lr_meta must be > 0".into()));
        }
        if self.k_meta_train == 0 || self.k_meta_test == 0 || self.k_shot_eval == 0 {
            return Err(MamlError::Config(
                "k_meta_train, k_meta_test and k_shot_eval must be > 0".into(),
            ));
        }
        if self.n_eval_tasks < 2 {
            return Err(MamlError::Config(
                "n_eval_tasks must be >= 2 for a confidence interval".into(),
            ));
        }
        if self.n_hidden.contains(&0) {
            return Err(MamlError::Config("hidden layer widths must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.adam_beta1) || !(0.0..1.0).contains(&self.adam_beta2) {
            return Err(MamlError::Config("adam betas must be in [0, 1)".into()));
        }
        if self.adam_eps.is_nan() || self.adam_eps <= 0.0 {
            return Err(MamlError::Config("adam_eps must be > 0".into()));
        }
        Ok(())
    }

    /// Keys present in this configuration but absent from the task defaults.
    #[must_use]
    pub fn unexpected_keys(&self) -> Vec<String> {
        self.extra.keys().cloned().collect()
    }

    /// Outer-optimizer settings.
    #[must_use]
    pub fn adam(&self) -> AdamConfig {
        AdamConfig {
            learning_rate: self.lr_meta,
            beta1: self.adam_beta1,
            beta2: self.adam_beta2,
            eps: self.adam_eps,
        }
    }

    /// Short content hash identifying this configuration.
    ///
    /// SHA-256 of the JSON encoding, first 12 hex characters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be encoded.
    pub fn config_hash(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        let result = hasher.finalize();
        Ok(format!("{result:x}")[..12].to_string())
    }
}
