//! Training configuration for DEUP.
//!
//! [`DeupConfig`] is the single source of truth for all hyper-parameters used
//! throughout the pipeline: the main and error predictor optimisers, their
//! schedules, the density estimator, the variance source and the ensemble.
//! It is serializable via [`serde`] so it can be stored to / restored from
//! JSON files next to the checkpoints it produced.
//!
//! Optimizer and scheduler entries are optional fields rather than map
//! entries: a missing key deserializes to `None` and is rejected when the
//! training loop is constructed, before any batch is processed.
//!
//! # Example
//!
//! ```rust
//! use deup_train::config::DeupConfig;
//!
//! let cfg = DeupConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.features, "bv");
//! assert_eq!(cfg.epochs, 75);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::features::FeatureMode;
use crate::schedule::SchedulerConfig;

// ---------------------------------------------------------------------------
// Loss kinds
// ---------------------------------------------------------------------------

/// Primary loss of the main predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Binary cross-entropy between sigmoid class scores and one-hot labels.
    Bce,
    /// Softmax cross-entropy on logits.
    CrossEntropy,
    /// Squared error against one-hot labels (Brier score).
    Mse,
}

/// Loss used to fit the error predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLoss {
    /// Element-wise binary cross-entropy, averaged manually.
    ///
    /// Error targets are mapped into `[0, 1)` as `1 - exp(-loss)`.
    Bce,
    /// Mean squared error against the raw per-example loss.
    Mse,
}

// ---------------------------------------------------------------------------
// Optimizers
// ---------------------------------------------------------------------------

/// Serializable optimizer description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    /// Stochastic gradient descent with optional momentum.
    Sgd {
        /// Learning rate.
        lr: f64,
        /// Momentum factor.
        #[serde(default)]
        momentum: f64,
        /// L2 weight decay.
        #[serde(default)]
        weight_decay: f64,
        /// Use Nesterov momentum.
        #[serde(default)]
        nesterov: bool,
    },
    /// Adam.
    Adam {
        /// Learning rate.
        lr: f64,
        /// First moment decay.
        #[serde(default = "default_beta1")]
        beta1: f64,
        /// Second moment decay.
        #[serde(default = "default_beta2")]
        beta2: f64,
        /// L2 weight decay.
        #[serde(default)]
        weight_decay: f64,
    },
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

impl OptimizerConfig {
    /// SGD with momentum and weight decay.
    pub fn sgd(lr: f64, momentum: f64, weight_decay: f64) -> Self {
        OptimizerConfig::Sgd { lr, momentum, weight_decay, nesterov: false }
    }

    /// Adam with default betas and no weight decay.
    pub fn adam(lr: f64) -> Self {
        OptimizerConfig::Adam { lr, beta1: default_beta1(), beta2: default_beta2(), weight_decay: 0.0 }
    }

    /// Initial learning rate.
    pub fn lr(&self) -> f64 {
        match self {
            OptimizerConfig::Sgd { lr, .. } | OptimizerConfig::Adam { lr, .. } => *lr,
        }
    }

    /// Check the hyper-parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.lr() > 0.0) || !self.lr().is_finite() {
            return Err(ConfigError::invalid_value("lr", "must be a finite value > 0.0"));
        }
        match self {
            OptimizerConfig::Sgd { momentum, weight_decay, nesterov, .. } => {
                if !(0.0..1.0).contains(momentum) {
                    return Err(ConfigError::invalid_value("momentum", "must be in [0.0, 1.0)"));
                }
                if *weight_decay < 0.0 {
                    return Err(ConfigError::invalid_value("weight_decay", "must be >= 0.0"));
                }
                if *nesterov && *momentum == 0.0 {
                    return Err(ConfigError::invalid_value("nesterov", "requires momentum > 0.0"));
                }
            }
            OptimizerConfig::Adam { beta1, beta2, weight_decay, .. } => {
                if !(0.0..1.0).contains(beta1) || !(0.0..1.0).contains(beta2) {
                    return Err(ConfigError::invalid_value("beta1 / beta2", "must be in [0.0, 1.0)"));
                }
                if *weight_decay < 0.0 {
                    return Err(ConfigError::invalid_value("weight_decay", "must be >= 0.0"));
                }
            }
        }
        Ok(())
    }
}

/// Optimizer entries per network role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfigs {
    /// Optimizer for the main predictor.
    #[serde(default)]
    pub f_optimizer: Option<OptimizerConfig>,
    /// Optimizer for the error predictor.
    #[serde(default)]
    pub e_optimizer: Option<OptimizerConfig>,
}

/// Scheduler entries per optimizer role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfigs {
    /// Schedule attached to `f_optimizer`.
    #[serde(default)]
    pub f_scheduler: Option<SchedulerConfig>,
    /// Schedule attached to `e_optimizer`.
    #[serde(default)]
    pub e_scheduler: Option<SchedulerConfig>,
}

// ---------------------------------------------------------------------------
// Density estimator
// ---------------------------------------------------------------------------

/// Hyper-parameters of the MAF-MoG density estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityConfig {
    /// Mixture components per dimension in the top block. Default: **10**.
    pub n_components: usize,
    /// Hidden units of every MADE layer. Default: **1024**.
    pub hidden_size: usize,
    /// Number of MADE blocks below the mixture block. Default: **5**.
    pub n_blocks: usize,
    /// Hidden layers inside each MADE. Default: **1**.
    pub n_hidden: usize,
    /// Mini-batch size, independent of the main predictor. Default: **100**.
    pub batch_size: usize,
    /// Adam learning rate. Default: **1e-4**.
    pub lr: f64,
    /// Passes over the dataset. Default: **32**.
    pub epochs: usize,
    /// Return log-densities rather than densities. Default: **true**.
    pub use_log_density: bool,
    /// Min-max scale scores into the training range. Default: **true**.
    pub use_density_scaling: bool,
    /// Shuffle seed for the fitting loader. Default: **0**.
    pub seed: u64,
}

impl Default for DensityConfig {
    fn default() -> Self {
        DensityConfig {
            n_components: 10,
            hidden_size: 1024,
            n_blocks: 5,
            n_hidden: 1,
            batch_size: 100,
            lr: 1e-4,
            epochs: 32,
            use_log_density: true,
            use_density_scaling: true,
            seed: 0,
        }
    }
}

impl DensityConfig {
    /// Validate all fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_components == 0 {
            return Err(ConfigError::invalid_value("n_components", "must be > 0"));
        }
        if self.hidden_size == 0 {
            return Err(ConfigError::invalid_value("hidden_size", "must be > 0"));
        }
        if self.n_hidden == 0 {
            return Err(ConfigError::invalid_value("n_hidden", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if self.lr <= 0.0 {
            return Err(ConfigError::invalid_value("lr", "must be > 0.0"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::invalid_value("epochs", "must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Variance source
// ---------------------------------------------------------------------------

/// Hyper-parameters of the DUQ variance source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceConfig {
    /// Side length of the square input images. Default: **32**.
    pub input_size: usize,
    /// Input channels. Default: **3**.
    pub in_channels: usize,
    /// Number of classes (one centroid each). Default: **10**.
    pub num_classes: usize,
    /// Width of the feature extractor output. Default: **512**.
    pub model_output_size: usize,
    /// Width of the centroid space. Default: **512**.
    pub centroid_size: usize,
    /// RBF kernel length scale. Default: **0.1**.
    pub length_scale: f64,
    /// Centroid EMA decay. Default: **0.999**.
    pub gamma: f64,
    /// Gradient penalty weight. Default: **0.5**.
    pub l_gradient_penalty: f64,
    /// SGD learning rate. Default: **0.05**.
    pub lr: f64,
    /// SGD momentum. Default: **0.9**.
    pub momentum: f64,
    /// SGD weight decay. Default: **5e-4**.
    pub weight_decay: f64,
    /// Epochs per `fit` call. Default: **10**.
    pub epochs: usize,
    /// Training accuracy at which a fit counts as converged. Default: **0.5**.
    pub convergence_accuracy: f64,
}

impl Default for VarianceConfig {
    fn default() -> Self {
        VarianceConfig {
            input_size: 32,
            in_channels: 3,
            num_classes: 10,
            model_output_size: 512,
            centroid_size: 512,
            length_scale: 0.1,
            gamma: 0.999,
            l_gradient_penalty: 0.5,
            lr: 0.05,
            momentum: 0.9,
            weight_decay: 5e-4,
            epochs: 10,
            convergence_accuracy: 0.5,
        }
    }
}

impl VarianceConfig {
    /// Validate all fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_size < 8 {
            return Err(ConfigError::invalid_value("input_size", "must be >= 8 (three 2x pooling stages)"));
        }
        if self.in_channels == 0 {
            return Err(ConfigError::invalid_value("in_channels", "must be > 0"));
        }
        if self.num_classes < 2 {
            return Err(ConfigError::invalid_value("num_classes", "must be >= 2"));
        }
        if self.model_output_size == 0 || self.centroid_size == 0 {
            return Err(ConfigError::invalid_value(
                "model_output_size / centroid_size",
                "must be > 0",
            ));
        }
        if self.length_scale <= 0.0 {
            return Err(ConfigError::invalid_value("length_scale", "must be > 0.0"));
        }
        if !(0.0..1.0).contains(&self.gamma) {
            return Err(ConfigError::invalid_value("gamma", "must be in [0.0, 1.0)"));
        }
        if self.l_gradient_penalty < 0.0 {
            return Err(ConfigError::invalid_value("l_gradient_penalty", "must be >= 0.0"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::invalid_value("epochs", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.convergence_accuracy) {
            return Err(ConfigError::invalid_value("convergence_accuracy", "must be in [0.0, 1.0]"));
        }
        OptimizerConfig::sgd(self.lr, self.momentum, self.weight_decay).validate()
    }
}

// ---------------------------------------------------------------------------
// Ensemble
// ---------------------------------------------------------------------------

/// Settings shared by every replica of an [`Ensemble`](crate::ensemble::Ensemble).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Requested mini-batch size, capped at half the dataset. Default: **16**.
    pub batch_size: usize,
    /// Optimizer built once per replica.
    pub optimizer: OptimizerConfig,
    /// Optional schedule built once per replica.
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    /// Seed of the shared batch stream. Default: **0**.
    pub seed: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        EnsembleConfig { batch_size: 16, optimizer: OptimizerConfig::adam(1e-3), scheduler: None, seed: 0 }
    }
}

impl EnsembleConfig {
    /// Validate all fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        self.optimizer.validate()?;
        if let Some(s) = &self.scheduler {
            s.validate()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DeupConfig
// ---------------------------------------------------------------------------

/// Complete configuration for a DEUP training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeupConfig {
    // -----------------------------------------------------------------------
    // Orchestration
    // -----------------------------------------------------------------------
    /// Epochs per `fit` call. Default: **75**.
    pub epochs: usize,

    /// Error-predictor feature selection (`"b"`, `"v"`, `"bv"`). Default: **"bv"**.
    pub features: String,

    /// Primary loss of the main predictor. Default: **BCE**.
    pub main_loss: LossKind,

    /// Loss of the error predictor. Default: **BCE**.
    pub error_loss: ErrorLoss,

    /// Run the ComputeErrorTargets / FitError phases. Default: **true**.
    ///
    /// Set to `false` to pretrain the main predictor alone.
    pub fit_error_predictor: bool,

    /// Stop after this many validations without improvement of the
    /// validation loss. `None` disables early stopping. Default: **None**.
    #[serde(default)]
    pub early_stopping_patience: Option<usize>,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Optimizers per network.
    pub optimizers: OptimizerConfigs,

    /// Learning-rate schedules per optimizer.
    #[serde(default)]
    pub schedulers: SchedulerConfigs,

    // -----------------------------------------------------------------------
    // Loaders
    // -----------------------------------------------------------------------
    /// Training batch size. Default: **256**.
    pub train_batch_size: usize,

    /// Validation batch size. Default: **128**.
    pub eval_batch_size: usize,

    /// OOD batch size. Default: **64**.
    pub ood_batch_size: usize,

    // -----------------------------------------------------------------------
    // Auxiliary models
    // -----------------------------------------------------------------------
    /// Density estimator settings.
    pub density: DensityConfig,

    /// Variance source settings.
    pub variance: VarianceConfig,

    /// Ensemble settings.
    #[serde(default)]
    pub ensemble: EnsembleConfig,

    // -----------------------------------------------------------------------
    // Device / reproducibility
    // -----------------------------------------------------------------------
    /// Use a CUDA GPU when available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA device index when `use_gpu` is `true`. Default: **0**.
    pub gpu_device_id: usize,

    /// Seed for loader shuffles and parameter initialisation. Default: **42**.
    pub seed: u64,
}

impl Default for DeupConfig {
    fn default() -> Self {
        DeupConfig {
            epochs: 75,
            features: "bv".to_string(),
            main_loss: LossKind::Bce,
            error_loss: ErrorLoss::Bce,
            fit_error_predictor: true,
            early_stopping_patience: None,
            optimizers: OptimizerConfigs {
                f_optimizer: Some(OptimizerConfig::sgd(0.05, 0.9, 5e-4)),
                e_optimizer: Some(OptimizerConfig::sgd(0.001, 0.9, 0.0)),
            },
            schedulers: SchedulerConfigs {
                f_scheduler: Some(SchedulerConfig::MultiStep { milestones: vec![25, 50], gamma: 0.2 }),
                e_scheduler: None,
            },
            train_batch_size: 256,
            eval_batch_size: 128,
            ood_batch_size: 64,
            density: DensityConfig::default(),
            variance: VarianceConfig::default(),
            ensemble: EnsembleConfig::default(),
            use_gpu: false,
            gpu_device_id: 0,
            seed: 42,
        }
    }
}

impl DeupConfig {
    /// Load a [`DeupConfig`] from a JSON file at `path` and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and any
    /// validation error.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: DeupConfig = serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON at `path`,
    /// creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Parsed feature selection.
    pub fn feature_mode(&self) -> Result<FeatureMode, ConfigError> {
        FeatureMode::parse(&self.features)
    }

    /// Validate all fields and return the first problem found.
    ///
    /// Missing optimizer entries are *not* reported here; they are checked
    /// against the supplied networks when the training loop is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::invalid_value("epochs", "must be > 0"));
        }
        self.feature_mode()?;
        if self.train_batch_size == 0 || self.eval_batch_size == 0 || self.ood_batch_size == 0 {
            return Err(ConfigError::invalid_value("*_batch_size", "batch sizes must be > 0"));
        }
        if self.early_stopping_patience == Some(0) {
            return Err(ConfigError::invalid_value("early_stopping_patience", "must be > 0 when set"));
        }
        for opt in [&self.optimizers.f_optimizer, &self.optimizers.e_optimizer].into_iter().flatten() {
            opt.validate()?;
        }
        for sched in [&self.schedulers.f_scheduler, &self.schedulers.e_scheduler].into_iter().flatten() {
            sched.validate()?;
        }
        self.density.validate()?;
        self.variance.validate()?;
        self.ensemble.validate()?;
        Ok(())
    }

    /// The device selected by `use_gpu` / `gpu_device_id`.
    ///
    /// Falls back to the CPU with a warning when CUDA is unavailable.
    #[cfg(feature = "tch-backend")]
    pub fn device(&self) -> tch::Device {
        if self.use_gpu {
            if tch::Cuda::is_available() {
                return tch::Device::Cuda(self.gpu_device_id);
            }
            tracing::warn!("use_gpu is set but CUDA is unavailable; training on CPU");
        }
        tch::Device::Cpu
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
