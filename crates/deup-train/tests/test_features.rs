//! Integration tests for [`deup_train::features`].

use deup_train::features::FeatureMode;

#[test]
fn density_selectors_are_synonyms() {
    assert_eq!(FeatureMode::parse("b").unwrap(), FeatureMode::parse("d").unwrap());
    assert_eq!(FeatureMode::parse("b").unwrap(), FeatureMode::density_only());
}

#[test]
fn column_order_ignores_selector_order() {
    for mode in ["bv", "vb", "dv", "vd"] {
        let parsed = FeatureMode::parse(mode).unwrap();
        assert_eq!(parsed, FeatureMode::both(), "mode {mode}");
        assert_eq!(parsed.to_string(), "bv");
    }
}

#[test]
fn width_counts_selected_signals() {
    assert_eq!(FeatureMode::density_only().width(), 1);
    assert_eq!(FeatureMode::variance_only().width(), 1);
    assert_eq!(FeatureMode::both().width(), 2);
}

#[test]
fn unsupported_modes_are_rejected() {
    for mode in ["", "x", "bb", "bvd", "B"] {
        assert!(FeatureMode::parse(mode).is_err(), "mode {mode:?} should be rejected");
    }
}

#[cfg(feature = "tch-backend")]
mod tch_tests {
    use deup_train::density::{DensityEstimator, DensityFitReport};
    use deup_train::error::{ConfigError, DeupError, DeupResult};
    use deup_train::features::{FeatureComposer, FeatureMode};
    use deup_train::variance::{VarianceFitReport, VarianceSource};
    use deup_train::dataset::{DataLoader, LabeledDataset};
    use std::path::Path;
    use tch::{Device, Kind, Tensor};

    /// Scores every example with a constant.
    struct Constant(f64);

    impl DensityEstimator for Constant {
        fn fit(&mut self, _dataset: &dyn LabeledDataset, _save_path: &Path) -> DeupResult<DensityFitReport> {
            unreachable!("not fitted in these tests")
        }
        fn score(&self, xs: &Tensor) -> DeupResult<Tensor> {
            Ok(Tensor::full([xs.size()[0]], self.0, (Kind::Float, Device::Cpu)))
        }
        fn is_fitted(&self) -> bool {
            true
        }
    }

    impl VarianceSource for Constant {
        fn fit(
            &mut self,
            _train_loader: &DataLoader<'_>,
            _save_path: &Path,
            _val_loader: Option<&DataLoader<'_>>,
        ) -> DeupResult<VarianceFitReport> {
            unreachable!("not fitted in these tests")
        }
        fn score(&self, xs: &Tensor) -> DeupResult<Tensor> {
            Ok(Tensor::full([xs.size()[0]], self.0, (Kind::Float, Device::Cpu)))
        }
        fn is_fitted(&self) -> bool {
            true
        }
        fn reset(&mut self) -> DeupResult<()> {
            Ok(())
        }
    }

    #[test]
    fn composed_features_put_density_first() {
        let composer = FeatureComposer::new(
            FeatureMode::parse("vb").unwrap(),
            Some(Box::new(Constant(0.25))),
            Some(Box::new(Constant(0.75))),
        )
        .unwrap();
        let xs = Tensor::zeros([3, 1, 4, 4], (Kind::Float, Device::Cpu));
        let features = composer.compose(&xs).unwrap();
        assert_eq!(features.size(), vec![3, 2]);
        assert!((features.double_value(&[0, 0]) - 0.25).abs() < 1e-6);
        assert!((features.double_value(&[2, 1]) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn single_signal_gives_one_column() {
        let composer =
            FeatureComposer::new(FeatureMode::variance_only(), None, Some(Box::new(Constant(0.5)))).unwrap();
        let xs = Tensor::zeros([5, 1, 4, 4], (Kind::Float, Device::Cpu));
        assert_eq!(composer.compose(&xs).unwrap().size(), vec![5, 1]);
        assert_eq!(composer.width(), 1);
    }

    #[test]
    fn missing_density_source_is_a_config_error() {
        let err = FeatureComposer::new(FeatureMode::both(), None, Some(Box::new(Constant(0.5)))).err().unwrap();
        assert!(matches!(err, ConfigError::MissingSignalSource { source_name: "density estimator", .. }));
    }

    #[test]
    fn non_finite_scores_are_numerical_errors() {
        let composer =
            FeatureComposer::new(FeatureMode::density_only(), Some(Box::new(Constant(f64::NAN))), None).unwrap();
        let xs = Tensor::zeros([2, 1, 4, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(composer.compose(&xs), Err(DeupError::Numerical { .. })));
    }
}

#[cfg(not(feature = "tch-backend"))]
#[test]
fn tch_backend_not_enabled() {}
