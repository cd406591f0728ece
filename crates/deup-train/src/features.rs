//! Uncertainty feature vectors for the error predictor.
//!
//! A [`FeatureMode`] selects which signals feed the error predictor:
//!
//! | mode         | columns                     |
//! |--------------|-----------------------------|
//! | `"b"`, `"d"` | density                     |
//! | `"v"`        | variance                    |
//! | `"bv"`, `"vb"`, `"dv"`, `"vd"` | density, variance |
//!
//! The density column always precedes the variance column, whatever the
//! order of the selectors in the mode string.
//!
//! With the `tch-backend` feature, [`FeatureComposer`] owns the fitted signal
//! sources and turns a batch of inputs into a `[batch, width]` tensor.

use std::fmt;

use crate::error::ConfigError;

/// Parsed feature selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureMode {
    density: bool,
    variance: bool,
}

impl FeatureMode {
    /// Parse a mode string.
    ///
    /// `b` and `d` both select the density column, `v` the variance column.
    /// An empty string, an unknown character or a repeated selector is an
    /// [`ConfigError::UnsupportedFeatureMode`].
    ///
    /// ```rust
    /// use deup_train::features::FeatureMode;
    ///
    /// let mode = FeatureMode::parse("vb").unwrap();
    /// assert_eq!(mode.width(), 2);
    /// assert_eq!(mode.to_string(), "bv");
    /// assert!(FeatureMode::parse("bb").is_err());
    /// ```
    pub fn parse(mode: &str) -> Result<Self, ConfigError> {
        if mode.is_empty() {
            return Err(ConfigError::unsupported_mode(mode, "at least one of `b`, `d` or `v` is required"));
        }
        let mut density = false;
        let mut variance = false;
        for ch in mode.chars() {
            let slot = match ch {
                'b' | 'd' => &mut density,
                'v' => &mut variance,
                other => {
                    return Err(ConfigError::unsupported_mode(mode, format!("unknown selector {other:?}")));
                }
            };
            if *slot {
                return Err(ConfigError::unsupported_mode(mode, format!("selector {ch:?} is repeated")));
            }
            *slot = true;
        }
        Ok(FeatureMode { density, variance })
    }

    /// Density column only.
    pub fn density_only() -> Self {
        FeatureMode { density: true, variance: false }
    }

    /// Variance column only.
    pub fn variance_only() -> Self {
        FeatureMode { density: false, variance: true }
    }

    /// Both columns.
    pub fn both() -> Self {
        FeatureMode { density: true, variance: true }
    }

    /// Whether the density column is selected.
    pub fn uses_density(&self) -> bool {
        self.density
    }

    /// Whether the variance column is selected.
    pub fn uses_variance(&self) -> bool {
        self.variance
    }

    /// Number of feature columns.
    pub fn width(&self) -> usize {
        usize::from(self.density) + usize::from(self.variance)
    }
}

impl fmt::Display for FeatureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.density {
            f.write_str("b")?;
        }
        if self.variance {
            f.write_str("v")?;
        }
        Ok(())
    }
}

#[cfg(feature = "tch-backend")]
pub use composer::FeatureComposer;

#[cfg(feature = "tch-backend")]
mod composer {
    use tch::{Kind, Tensor};
    use tracing::debug;

    use super::FeatureMode;
    use crate::density::DensityEstimator;
    use crate::error::{ConfigError, DeupError, DeupResult};
    use crate::tensor::ensure_finite;
    use crate::variance::VarianceSource;

    /// Builds error-predictor inputs from fitted signal sources.
    ///
    /// Scoring takes `&self`; the sources can only be refitted through
    /// [`density_mut`](Self::density_mut) / [`variance_mut`](Self::variance_mut),
    /// which need exclusive access.
    pub struct FeatureComposer {
        mode: FeatureMode,
        density: Option<Box<dyn DensityEstimator>>,
        variance: Option<Box<dyn VarianceSource>>,
    }

    impl FeatureComposer {
        /// Wire `mode` to the supplied sources.
        ///
        /// # Errors
        ///
        /// [`ConfigError::MissingSignalSource`] when the mode selects a
        /// column whose source is `None`. Supplied but unselected sources are
        /// kept and ignored.
        pub fn new(
            mode: FeatureMode,
            density: Option<Box<dyn DensityEstimator>>,
            variance: Option<Box<dyn VarianceSource>>,
        ) -> Result<Self, ConfigError> {
            if mode.uses_density() && density.is_none() {
                return Err(ConfigError::MissingSignalSource {
                    mode: mode.to_string(),
                    source_name: "density estimator",
                });
            }
            if mode.uses_variance() && variance.is_none() {
                return Err(ConfigError::MissingSignalSource {
                    mode: mode.to_string(),
                    source_name: "variance source",
                });
            }
            Ok(FeatureComposer { mode, density, variance })
        }

        /// The feature selection.
        pub fn mode(&self) -> FeatureMode {
            self.mode
        }

        /// Output width.
        pub fn width(&self) -> usize {
            self.mode.width()
        }

        /// The density estimator, if supplied.
        pub fn density(&self) -> Option<&dyn DensityEstimator> {
            self.density.as_deref()
        }

        /// Exclusive access to the density estimator for refitting.
        pub fn density_mut(&mut self) -> Option<&mut (dyn DensityEstimator + 'static)> {
            self.density.as_deref_mut()
        }

        /// The variance source, if supplied.
        pub fn variance(&self) -> Option<&dyn VarianceSource> {
            self.variance.as_deref()
        }

        /// Exclusive access to the variance source for refitting.
        pub fn variance_mut(&mut self) -> Option<&mut (dyn VarianceSource + 'static)> {
            self.variance.as_deref_mut()
        }

        /// `[batch, width]` feature tensor for `xs`.
        ///
        /// # Errors
        ///
        /// [`DeupError::NotFitted`] when a selected source has not been
        /// fitted, [`DeupError::Numerical`] when a score is non-finite.
        pub fn compose(&self, xs: &Tensor) -> DeupResult<Tensor> {
            let mut columns: Vec<Tensor> = Vec::with_capacity(self.width());
            if self.mode.uses_density() {
                let est = self.density.as_deref().ok_or(DeupError::not_fitted("density estimator"))?;
                columns.push(est.score(xs)?.to_kind(Kind::Float).view([-1, 1]));
            }
            if self.mode.uses_variance() {
                let src = self.variance.as_deref().ok_or(DeupError::not_fitted("variance source"))?;
                columns.push(src.score(xs)?.to_kind(Kind::Float).view([-1, 1]));
            }
            let features = Tensor::cat(&columns, 1);
            ensure_finite(&features, "feature composition")?;
            debug!("composed {:?} features for mode {}", features.size(), self.mode);
            Ok(features)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_orders_map_to_density_first() {
        assert_eq!(FeatureMode::parse("vb").unwrap(), FeatureMode::both());
        assert_eq!(FeatureMode::parse("dv").unwrap(), FeatureMode::both());
        assert_eq!(FeatureMode::both().to_string(), "bv");
    }

    #[test]
    fn d_is_an_alias_for_b() {
        assert_eq!(FeatureMode::parse("d").unwrap(), FeatureMode::density_only());
    }

    #[test]
    fn width_matches_selection() {
        assert_eq!(FeatureMode::parse("b").unwrap().width(), 1);
        assert_eq!(FeatureMode::parse("v").unwrap().width(), 1);
        assert_eq!(FeatureMode::parse("bv").unwrap().width(), 2);
    }

    #[test]
    fn bad_modes_are_rejected() {
        for bad in ["", "x", "bd", "vv", "bvq", "B"] {
            assert!(
                matches!(FeatureMode::parse(bad), Err(ConfigError::UnsupportedFeatureMode { .. })),
                "mode {bad:?} should be rejected"
            );
        }
    }
}
