//! Error types for the DEUP training pipeline.
//!
//! This module is the single source of truth for all error types in the
//! crate. Every module that produces an error imports its error type from
//! here rather than defining it inline.
//!
//! ## Hierarchy
//!
//! ```text
//! DeupError (top-level)
//! ├── ConfigError    (hyper-parameters, optimizer pairing, feature modes)
//! ├── DatasetError   (data loading, I/O, format, splits)
//! └── ArtifactError  (checkpoint naming contract)
//! ```
//!
//! Numerical failures (non-finite losses or covariances) are always returned
//! as [`DeupError::Numerical`]; no code path logs them and carries on.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// DeupResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type DeupResult<T> = Result<T, DeupError>;

// ---------------------------------------------------------------------------
// DeupError (top-level aggregator)
// ---------------------------------------------------------------------------

/// Top-level error type for the DEUP pipeline.
///
/// Lower-level functions in [`crate::config`], [`crate::dataset`] and
/// [`crate::artifact`] return their own module-specific error types which are
/// coerced into `DeupError` via [`From`].
#[derive(Debug, Error)]
pub enum DeupError {
    /// A configuration validation or wiring error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset loading or access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// A checkpoint name violated the naming contract.
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// A component was queried before it was successfully fitted.
    #[error("{component} has not been fitted")]
    NotFitted {
        /// Name of the component that was queried.
        component: &'static str,
    },

    /// A loss, likelihood or covariance became non-finite.
    #[error("Numerical error in {context}: {detail}")]
    Numerical {
        /// Where the problem was detected (e.g. `"density fit"`).
        context: &'static str,
        /// Human-readable description, usually including the offending value.
        detail: String,
    },

    /// An auxiliary model did not reach its fitting target within budget.
    #[error("Fitting error in {component}: {reason}")]
    Fitting {
        /// Component that failed to converge.
        component: &'static str,
        /// Why the fit is considered unsuccessful.
        reason: String,
    },

    /// A shape mismatch was detected between two tensors or arrays.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<i64>,
        /// Actual shape.
        actual: Vec<i64>,
    },

    /// Weights or training state could not be saved or loaded.
    #[error("Checkpoint error: {message} (path: {path:?})")]
    Checkpoint {
        /// Human-readable description.
        message: String,
        /// Path that was being accessed.
        path: PathBuf,
    },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error without path context.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// libtorch reported an error.
    #[cfg(feature = "tch-backend")]
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
}

impl DeupError {
    /// Construct a [`DeupError::Numerical`].
    pub fn numerical<S: Into<String>>(context: &'static str, detail: S) -> Self {
        DeupError::Numerical { context, detail: detail.into() }
    }

    /// Construct a [`DeupError::Fitting`].
    pub fn fitting<S: Into<String>>(component: &'static str, reason: S) -> Self {
        DeupError::Fitting { component, reason: reason.into() }
    }

    /// Construct a [`DeupError::NotFitted`].
    pub fn not_fitted(component: &'static str) -> Self {
        DeupError::NotFitted { component }
    }

    /// Construct a [`DeupError::Checkpoint`].
    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        DeupError::Checkpoint { message: msg.into(), path: path.into() }
    }

    /// Construct a [`DeupError::ShapeMismatch`].
    pub fn shape_mismatch(expected: Vec<i64>, actual: Vec<i64>) -> Self {
        DeupError::ShapeMismatch { expected, actual }
    }

    /// Returns `true` for errors that must abort a training run.
    ///
    /// Only [`DeupError::Fitting`] is recoverable: the caller may keep the
    /// last state of the auxiliary model and continue.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DeupError::Fitting { .. })
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when validating configuration or wiring components.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A network was supplied without a matching optimizer entry.
    #[error("Network `{network}` has no matching optimizer entry `{optimizer}`")]
    MissingOptimizer {
        /// Network role (e.g. `"f_predictor"`).
        network: &'static str,
        /// Expected optimizer key (e.g. `"f_optimizer"`).
        optimizer: &'static str,
    },

    /// A scheduler was supplied for an optimizer that does not exist.
    #[error("Scheduler `{scheduler}` refers to missing optimizer `{optimizer}`")]
    OrphanScheduler {
        /// Scheduler key.
        scheduler: &'static str,
        /// Optimizer key it would be attached to.
        optimizer: &'static str,
    },

    /// The feature-selection mode string is not supported.
    #[error("Unsupported feature mode `{mode}`: {reason}")]
    UnsupportedFeatureMode {
        /// The offending mode string.
        mode: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The selected features need a signal source that was not supplied.
    #[error("Feature mode `{mode}` requires a {source_name} but none was supplied")]
    MissingSignalSource {
        /// Feature mode as written.
        mode: String,
        /// Missing source (`"density estimator"` or `"variance source"`).
        source_name: &'static str,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }

    /// Construct a [`ConfigError::MissingOptimizer`].
    pub fn missing_optimizer(network: &'static str, optimizer: &'static str) -> Self {
        ConfigError::MissingOptimizer { network, optimizer }
    }

    /// Construct a [`ConfigError::UnsupportedFeatureMode`].
    pub fn unsupported_mode<S: Into<String>>(mode: &str, reason: S) -> Self {
        ConfigError::UnsupportedFeatureMode { mode: mode.to_string(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while loading or accessing dataset samples.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A required data file was not found on disk.
    #[error("Data not found at `{path}`: {message}")]
    DataNotFound {
        /// Path that was expected to contain data.
        path: PathBuf,
        /// Additional context.
        message: String,
    },

    /// A file was found but its format or shape is wrong.
    #[error("Invalid data format in `{path}`: {message}")]
    InvalidFormat {
        /// Path of the malformed file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// A sample index is out of bounds.
    #[error("Index {idx} out of bounds (dataset has {len} samples)")]
    IndexOutOfBounds {
        /// The requested index.
        idx: usize,
        /// Total length of the dataset.
        len: usize,
    },

    /// The dataset has no samples and cannot be used for fitting.
    #[error("Dataset `{name}` is empty")]
    Empty {
        /// Name of the empty dataset.
        name: String,
    },

    /// A split index outside the configured label pairs was requested.
    #[error("Split {split} does not exist ({available} splits available)")]
    UnknownSplit {
        /// Requested split index.
        split: usize,
        /// Number of defined splits.
        available: usize,
    },

    /// Samples in one batch do not share a shape.
    #[error("Sample shape mismatch: expected {expected:?}, got {actual:?}")]
    SampleShape {
        /// Shape of the first sample in the batch.
        expected: Vec<usize>,
        /// Shape of the offending sample.
        actual: Vec<usize>,
    },

    /// An I/O error that carries no path context.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatasetError {
    /// Construct a [`DatasetError::DataNotFound`].
    pub fn not_found<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::DataNotFound { path: path.into(), message: msg.into() }
    }

    /// Construct a [`DatasetError::InvalidFormat`].
    pub fn invalid_format<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::InvalidFormat { path: path.into(), message: msg.into() }
    }
}

// ---------------------------------------------------------------------------
// ArtifactError
// ---------------------------------------------------------------------------

/// Errors produced by the artifact naming contract in [`crate::artifact`].
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// A required naming field is empty.
    #[error("Artifact field `{field}` must not be empty")]
    EmptyField {
        /// Name of the empty field.
        field: &'static str,
    },

    /// A naming field contains a character outside the allowed set.
    #[error("Artifact field `{field}` contains invalid character {ch:?} in {value:?}")]
    InvalidCharacter {
        /// Name of the field.
        field: &'static str,
        /// The full field value.
        value: String,
        /// First offending character.
        ch: char,
    },

    /// A file name does not follow `<artifact>_<dataset>_split_<i>_<tag>.<ext>`.
    #[error("`{name}` does not follow the artifact naming template: {reason}")]
    Malformed {
        /// The file name being parsed.
        name: String,
        /// Which part of the template failed.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_into_top_level() {
        let err: DeupError = ConfigError::missing_optimizer("f_predictor", "f_optimizer").into();
        assert!(matches!(
            err,
            DeupError::Config(ConfigError::MissingOptimizer { network: "f_predictor", .. })
        ));
        assert!(err.to_string().contains("f_optimizer"));
    }

    #[test]
    fn only_fitting_errors_are_recoverable() {
        assert!(!DeupError::fitting("duq", "accuracy 0.10 < 0.50").is_fatal());
        assert!(DeupError::numerical("density fit", "loss = NaN").is_fatal());
        assert!(DeupError::not_fitted("ensemble").is_fatal());
    }

    #[test]
    fn numerical_error_message_names_context() {
        let err = DeupError::numerical("posterior", "variance contains inf");
        assert_eq!(err.to_string(), "Numerical error in posterior: variance contains inf");
    }
}
