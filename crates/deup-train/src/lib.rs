//! # DEUP Training Infrastructure
//!
//! Direct Epistemic Uncertainty Prediction: a main predictor `f` is trained
//! jointly with an error predictor `e` that learns to predict the loss of
//! `f` from uncertainty features (a density score and a variance score).
//! The crate also carries the deep-ensemble baseline and the split-wise
//! out-of-distribution pretraining pipeline (`ood_pretrain` binary).
//!
//! ## Architecture
//!
//! ```text
//! DeupConfig ──► DeupEstimator ──► f: Predictor ──► per-example loss ──► error targets
//!      │               │                                                     │
//!      │          DataLoader                                                 ▼
//!      │               │          FeatureComposer ──► features ──► e: Predictor
//!      │        LabeledDataset      │           │
//!      │   (NpyImageDataset |   MafMogDensity  DuqVariance
//!      │    SyntheticImageDataset)
//!      │
//!      └──► schedule / metrics / artifact
//! ```
//!
//! Everything that touches tensors (networks, flows, the training loop, the
//! ensemble) requires the `tch-backend` feature. Configuration, datasets,
//! metrics, schedules and artifact naming are plain Rust and always compile.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deup_train::config::DeupConfig;
//! use deup_train::dataset::{DataLoader, LabeledDataset, SyntheticImageConfig, SyntheticImageDataset};
//!
//! let config = DeupConfig::default();
//! config.validate().expect("config is valid");
//!
//! let dataset = SyntheticImageDataset::new(200, SyntheticImageConfig::default());
//! let loader = DataLoader::new(&dataset, config.train_batch_size, true, config.seed);
//! for batch in loader.iter_epoch(0).take(1) {
//!     println!("inputs {:?}, {} labels", batch.inputs.shape(), batch.labels.len());
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod artifact;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod metrics;
pub mod schedule;

#[cfg(feature = "tch-backend")]
pub mod density;
#[cfg(feature = "tch-backend")]
pub mod ensemble;
#[cfg(feature = "tch-backend")]
pub mod losses;
#[cfg(feature = "tch-backend")]
pub mod model;
#[cfg(feature = "tch-backend")]
pub mod optim;
#[cfg(feature = "tch-backend")]
pub mod tensor;
#[cfg(feature = "tch-backend")]
pub mod trainer;
#[cfg(feature = "tch-backend")]
pub mod variance;

// Convenient re-exports at the crate root.
pub use artifact::ArtifactName;
pub use config::{DensityConfig, DeupConfig, EnsembleConfig, VarianceConfig};
pub use dataset::{DataLoader, LabelSplit, LabeledDataset, NpyImageDataset, Subset, SyntheticImageDataset};
pub use error::{ArtifactError, ConfigError, DatasetError, DeupError, DeupResult};
pub use features::FeatureMode;
pub use metrics::{roc_auc, EpochRecord, ValidationReport};

#[cfg(feature = "tch-backend")]
pub use ensemble::{DiagonalGaussian, Ensemble};
#[cfg(feature = "tch-backend")]
pub use features::FeatureComposer;
#[cfg(feature = "tch-backend")]
pub use trainer::{DeupData, DeupEstimator, DeupNetworks, FitReport, Phase, SignalSources};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
