//! Integration tests for [`deup_train::trainer`].
//!
//! The signal sources are small deterministic stand-ins so the tests exercise
//! the orchestration (phases, epochs, targets, validation) rather than the
//! flows and kernels, which have their own tests.

#[cfg(feature = "tch-backend")]
mod tch_tests {
    use std::path::Path;

    use approx::assert_relative_eq;
    use deup_train::config::{DeupConfig, ErrorLoss, LossKind, OptimizerConfig};
    use deup_train::dataset::{
        DataLoader, LabeledDataset, SyntheticImageConfig, SyntheticImageDataset,
    };
    use deup_train::density::{DensityEstimator, DensityFitReport};
    use deup_train::error::{ConfigError, DeupError, DeupResult};
    use deup_train::metrics::EpochRecord;
    use deup_train::model::{Activation, FusedResNet, Mlp, MlpSpec, OutputActivation, Predictor, ResNetDepth};
    use deup_train::schedule::SchedulerConfig;
    use deup_train::trainer::{DeupData, DeupEstimator, DeupNetworks, Phase, SignalSources};
    use deup_train::variance::{VarianceFitReport, VarianceSource};
    use tch::{Kind, Tensor};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn device() -> tch::Device {
        tch::Device::Cpu
    }

    /// Mean pixel intensity as a density score.
    struct MeanPixel;

    impl DensityEstimator for MeanPixel {
        fn fit(&mut self, dataset: &dyn LabeledDataset, _save_path: &Path) -> DeupResult<DensityFitReport> {
            Ok(DensityFitReport { epochs: 0, final_nll: 0.0, num_samples: dataset.len(), score_min: 0.0, score_max: 1.0 })
        }
        fn score(&self, xs: &Tensor) -> DeupResult<Tensor> {
            Ok(xs.flatten(1, -1).mean_dim(&[1_i64][..], false, Kind::Float))
        }
        fn is_fitted(&self) -> bool {
            true
        }
    }

    /// Pixel standard deviation as a variance score.
    struct PixelSpread;

    impl VarianceSource for PixelSpread {
        fn fit(
            &mut self,
            _train_loader: &DataLoader<'_>,
            _save_path: &Path,
            _val_loader: Option<&DataLoader<'_>>,
        ) -> DeupResult<VarianceFitReport> {
            Ok(VarianceFitReport {
                epochs: 0,
                total_epochs: 0,
                final_loss: 0.0,
                train_accuracy: 1.0,
                val_accuracy: None,
                converged: true,
            })
        }
        fn score(&self, xs: &Tensor) -> DeupResult<Tensor> {
            Ok(xs.flatten(1, -1).std_dim(&[1_i64][..], false, false))
        }
        fn is_fitted(&self) -> bool {
            true
        }
        fn reset(&mut self) -> DeupResult<()> {
            Ok(())
        }
    }

    /// Pixel spread that forgets its fit on `reset`.
    struct RefittableSpread {
        fitted: bool,
    }

    impl VarianceSource for RefittableSpread {
        fn fit(
            &mut self,
            train_loader: &DataLoader<'_>,
            save_path: &Path,
            val_loader: Option<&DataLoader<'_>>,
        ) -> DeupResult<VarianceFitReport> {
            self.fitted = true;
            PixelSpread.fit(train_loader, save_path, val_loader)
        }
        fn score(&self, xs: &Tensor) -> DeupResult<Tensor> {
            if !self.fitted {
                return Err(DeupError::not_fitted("pixel spread"));
            }
            PixelSpread.score(xs)
        }
        fn is_fitted(&self) -> bool {
            self.fitted
        }
        fn reset(&mut self) -> DeupResult<()> {
            self.fitted = false;
            Ok(())
        }
    }

    fn images(n: usize, shift: f32) -> SyntheticImageDataset {
        SyntheticImageDataset::new(
            n,
            SyntheticImageConfig { channels: 1, height: 4, width: 4, num_classes: 2, shift, ..Default::default() },
        )
    }

    fn mlp(input_dim: usize, output_dim: usize) -> Box<dyn Predictor> {
        Box::new(Mlp::new(
            MlpSpec {
                input_dim,
                output_dim,
                hidden_size: 16,
                n_hidden: 1,
                activation: Activation::Relu,
                output: OutputActivation::Sigmoid,
            },
            device(),
        ))
    }

    fn config() -> DeupConfig {
        let mut cfg = DeupConfig::default();
        cfg.optimizers.f_optimizer = Some(OptimizerConfig::sgd(0.1, 0.9, 0.0));
        cfg.optimizers.e_optimizer = Some(OptimizerConfig::adam(1e-2));
        cfg
    }

    fn estimator(cfg: DeupConfig) -> DeupEstimator {
        tch::manual_seed(0);
        let networks = DeupNetworks { f_predictor: mlp(16, 2), e_predictor: Some(mlp(2, 1)) };
        let signals = SignalSources { density: Some(Box::new(MeanPixel)), variance: Some(Box::new(PixelSpread)) };
        DeupEstimator::new(networks, signals, cfg, device()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn missing_main_optimizer_fails_before_training() {
        let mut cfg = config();
        cfg.optimizers.f_optimizer = None;
        cfg.schedulers.f_scheduler = None;
        let networks = DeupNetworks { f_predictor: mlp(16, 2), e_predictor: Some(mlp(2, 1)) };
        let signals = SignalSources { density: Some(Box::new(MeanPixel)), variance: Some(Box::new(PixelSpread)) };
        let err = DeupEstimator::new(networks, signals, cfg, device()).err().unwrap();
        assert!(
            matches!(err, DeupError::Config(ConfigError::MissingOptimizer { optimizer: "f_optimizer", .. })),
            "got {err:?}"
        );
    }

    #[test]
    fn missing_error_optimizer_is_rejected() {
        let mut cfg = config();
        cfg.optimizers.e_optimizer = None;
        let networks = DeupNetworks { f_predictor: mlp(16, 2), e_predictor: Some(mlp(2, 1)) };
        let signals = SignalSources { density: Some(Box::new(MeanPixel)), variance: Some(Box::new(PixelSpread)) };
        let err = DeupEstimator::new(networks, signals, cfg, device()).err().unwrap();
        assert!(matches!(err, DeupError::Config(ConfigError::MissingOptimizer { network: "e_predictor", .. })));
    }

    #[test]
    fn error_predictor_width_must_match_features() {
        let networks = DeupNetworks { f_predictor: mlp(16, 2), e_predictor: Some(mlp(3, 1)) };
        let signals = SignalSources { density: Some(Box::new(MeanPixel)), variance: Some(Box::new(PixelSpread)) };
        let err = DeupEstimator::new(networks, signals, config(), device()).err().unwrap();
        assert!(matches!(err, DeupError::Config(ConfigError::InvalidValue { field: "e_predictor", .. })));
    }

    #[test]
    fn fresh_estimator_is_in_init() {
        let est = estimator(config());
        assert_eq!(est.phase(), Phase::Init);
        assert_eq!(est.epoch(), 0);
        assert_eq!(est.composer().map(|c| c.width()), Some(2));
    }

    // -----------------------------------------------------------------------
    // Training
    // -----------------------------------------------------------------------

    #[test]
    fn epoch_counter_continues_across_fit_calls() {
        let train = images(32, 0.0);
        let mut est = estimator(config());
        let data = DeupData::new(DataLoader::new(&train, 8, true, 3));

        est.fit(&data, 1, None).unwrap();
        let report = est.fit(&data, 1, None).unwrap();

        assert_eq!(est.epoch(), 2);
        assert_eq!(report.epoch, 2);
        assert_eq!(report.epochs_run, 1);
        assert_eq!(est.phase(), Phase::Done);
        let epochs: Vec<usize> = est.history().iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![1, 2]);
        assert!(est.history().iter().all(|r| r.e_loss.is_some()));
    }

    #[test]
    fn error_targets_follow_the_current_main_predictor() {
        let train = images(32, 0.0);
        let mut est = estimator(config());
        let batch = DataLoader::new(&train, 8, false, 0).iter_epoch(0).next().unwrap();
        let (xs, labels) = deup_train::tensor::batch_to_tensors(&batch, device());

        let before = est.error_targets(&xs, &labels).unwrap();
        assert_eq!(before.size(), vec![8]);
        assert!(before.min().double_value(&[]) >= 0.0);

        est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 1)), 1, None).unwrap();
        let after = est.error_targets(&xs, &labels).unwrap();
        let change = (&after - &before).abs().max().double_value(&[]);
        assert!(change > 1e-6, "targets unchanged after an epoch (max change {change})");
    }

    #[test]
    fn validation_reports_auroc_with_ood_loader() {
        let train = images(32, 0.0);
        let val = images(16, 0.0);
        let ood = images(16, 1.5);
        let mut est = estimator(config());
        let data = DeupData {
            train_loader: DataLoader::new(&train, 8, true, 0),
            error_loader: None,
            ood_loader: Some(DataLoader::new(&ood, 8, false, 0)),
        };
        let val_loader = DataLoader::new(&val, 8, false, 0);
        let report = est.fit(&data, 2, Some(&val_loader)).unwrap();

        let v = report.history.last().unwrap().validation.clone().unwrap();
        assert_eq!(v.num_samples, 16);
        assert!(v.ood_auroc.is_some());
        assert!(v.mean_uncertainty.is_some() && v.mean_ood_uncertainty.is_some());

        let u = est.predict_uncertainty(&Tensor::zeros([3, 1, 4, 4], (Kind::Float, device()))).unwrap();
        assert_eq!(u.size(), vec![3]);
        assert!(u.min().double_value(&[]) >= 0.0 && u.max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn schedules_step_once_per_epoch() {
        let mut cfg = config();
        cfg.schedulers.f_scheduler = Some(SchedulerConfig::MultiStep { milestones: vec![1], gamma: 0.5 });
        cfg.schedulers.e_scheduler = Some(SchedulerConfig::Multiplicative { factor: 0.5 });
        let train = images(16, 0.0);
        let mut est = estimator(cfg);
        est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 3, None).unwrap();

        let f_rates: Vec<f64> = est.history().iter().map(|r| r.f_lr).collect();
        let e_rates: Vec<f64> = est.history().iter().map(|r| r.e_lr.unwrap()).collect();
        for (got, want) in f_rates.iter().zip([0.1, 0.05, 0.05]) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
        for (got, want) in e_rates.iter().zip([0.01, 0.005, 0.0025]) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
        assert_relative_eq!(est.f_lr(), 0.05, epsilon = 1e-12);
        assert_relative_eq!(est.e_lr().unwrap(), 0.00125, epsilon = 1e-12);
    }

    #[test]
    fn early_stopping_ends_a_stalled_fit() {
        let mut cfg = config();
        // Updates this small leave f32 weights bit-identical, so the
        // validation loss cannot improve.
        cfg.optimizers.f_optimizer = Some(OptimizerConfig::sgd(1e-30, 0.0, 0.0));
        cfg.early_stopping_patience = Some(1);
        let train = images(16, 0.0);
        let val = images(8, 0.0);
        let mut est = estimator(cfg);
        let val_loader = DataLoader::new(&val, 8, false, 0);
        let report = est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 5, Some(&val_loader)).unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.epochs_run, 2);
        assert_eq!(est.epoch(), 2);
        assert_eq!(est.phase(), Phase::Done);
        let losses: Vec<f64> = report.history.iter().map(|r| r.validation.as_ref().unwrap().mean_loss).collect();
        assert_eq!(losses[0], losses[1]);
    }

    #[test]
    fn patience_longer_than_the_fit_never_stops() {
        let mut cfg = config();
        cfg.early_stopping_patience = Some(3);
        let train = images(16, 0.0);
        let mut est = estimator(cfg);
        let val_loader = DataLoader::new(&train, 8, false, 0);
        let report = est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 2, Some(&val_loader)).unwrap();
        assert!(!report.stopped_early);
        assert_eq!(report.epochs_run, 2);
    }

    #[test]
    fn error_loader_supervises_the_error_predictor() {
        let train = images(16, 0.0);
        let held_out = images(16, 1.5);

        let mut default_est = estimator(config());
        let default_report = default_est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 1, None).unwrap();

        let mut held_out_est = estimator(config());
        let data = DeupData {
            train_loader: DataLoader::new(&train, 8, true, 0),
            error_loader: Some(DataLoader::new(&held_out, 8, false, 0)),
            ood_loader: None,
        };
        let held_out_report = held_out_est.fit(&data, 1, None).unwrap();

        let (a, b) = (&default_report.history[0], &held_out_report.history[0]);
        assert_relative_eq!(a.f_loss, b.f_loss, epsilon = 1e-6);
        let (ea, eb) = (a.e_loss.unwrap(), b.e_loss.unwrap());
        assert!(eb.is_finite());
        assert!((ea - eb).abs() > 1e-6, "error loss ignored the error loader ({ea} vs {eb})");
    }

    #[test]
    fn refitting_a_signal_source_through_the_composer() {
        let train = images(16, 0.0);
        tch::manual_seed(0);
        let networks = DeupNetworks { f_predictor: mlp(16, 2), e_predictor: Some(mlp(2, 1)) };
        let signals =
            SignalSources { density: Some(Box::new(MeanPixel)), variance: Some(Box::new(RefittableSpread { fitted: true })) };
        let mut est = DeupEstimator::new(networks, signals, config(), device()).unwrap();
        let loader = DataLoader::new(&train, 8, true, 0);
        est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 1, None).unwrap();
        let xs = Tensor::zeros([2, 1, 4, 4], (Kind::Float, device()));
        assert!(est.predict_uncertainty(&xs).is_ok());

        let composer = est.composer_mut().unwrap();
        assert!(composer.density_mut().unwrap().is_fitted());
        composer.variance_mut().unwrap().reset().unwrap();
        assert!(matches!(est.predict_uncertainty(&xs), Err(DeupError::NotFitted { .. })));

        let tmp = tempfile::tempdir().unwrap();
        let source = est.composer_mut().unwrap().variance_mut().unwrap();
        source.fit(&loader, &tmp.path().join("spread.ot"), None).unwrap();
        assert_eq!(est.predict_uncertainty(&xs).unwrap().size(), vec![2]);
    }

    #[test]
    fn empty_query_yields_empty_uncertainty() {
        let train = images(16, 0.0);
        let mut est = estimator(config());
        est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 1, None).unwrap();
        let u = est.predict_uncertainty(&Tensor::zeros([0, 1, 4, 4], (Kind::Float, device()))).unwrap();
        assert_eq!(u.size(), vec![0]);
    }

    // -----------------------------------------------------------------------
    // Fused backbones
    // -----------------------------------------------------------------------

    fn rgb_images(n: usize) -> SyntheticImageDataset {
        SyntheticImageDataset::new(
            n,
            SyntheticImageConfig { channels: 3, height: 8, width: 8, num_classes: 2, ..Default::default() },
        )
    }

    fn fused_config() -> DeupConfig {
        let mut cfg = config();
        cfg.main_loss = LossKind::CrossEntropy;
        cfg.error_loss = ErrorLoss::Mse;
        cfg.optimizers.f_optimizer = Some(OptimizerConfig::sgd(0.01, 0.9, 0.0));
        cfg
    }

    #[test]
    fn fused_main_predictor_receives_features() {
        tch::manual_seed(0);
        let f = FusedResNet::new(ResNetDepth::R18, 2, false, 2, device());
        let networks = DeupNetworks { f_predictor: Box::new(f), e_predictor: Some(mlp(2, 1)) };
        let signals = SignalSources { density: Some(Box::new(MeanPixel)), variance: Some(Box::new(PixelSpread)) };
        let mut est = DeupEstimator::new(networks, signals, fused_config(), device()).unwrap();

        let train = rgb_images(16);
        let report = est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 1, None).unwrap();
        assert!(report.final_f_loss().unwrap().is_finite());
        let xs = Tensor::ones([3, 3, 8, 8], (Kind::Float, device()));
        assert_eq!(est.predict(&xs).unwrap().size(), vec![3, 2]);
        assert_eq!(est.predict_uncertainty(&xs).unwrap().size(), vec![3]);
    }

    #[test]
    fn fused_error_predictor_sees_images_and_features() {
        tch::manual_seed(0);
        let e = FusedResNet::new(ResNetDepth::R18, 1, true, 2, device());
        let networks = DeupNetworks { f_predictor: mlp(192, 2), e_predictor: Some(Box::new(e)) };
        let signals = SignalSources { density: Some(Box::new(MeanPixel)), variance: Some(Box::new(PixelSpread)) };
        let mut est = DeupEstimator::new(networks, signals, fused_config(), device()).unwrap();

        let train = rgb_images(16);
        let report = est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 1, None).unwrap();
        assert!(report.history[0].e_loss.unwrap().is_finite());
        let u = est.predict_uncertainty(&Tensor::ones([3, 3, 8, 8], (Kind::Float, device()))).unwrap();
        assert_eq!(u.size(), vec![3]);
        assert!(u.min().double_value(&[]) >= 0.0);
    }

    #[test]
    fn fused_side_channel_width_must_match_features() {
        let f = FusedResNet::new(ResNetDepth::R18, 2, false, 3, device());
        let networks = DeupNetworks { f_predictor: Box::new(f), e_predictor: Some(mlp(2, 1)) };
        let signals = SignalSources { density: Some(Box::new(MeanPixel)), variance: Some(Box::new(PixelSpread)) };
        let err = DeupEstimator::new(networks, signals, fused_config(), device()).err().unwrap();
        assert!(matches!(err, DeupError::Config(ConfigError::InvalidValue { field: "f_predictor", .. })));
    }

    #[test]
    fn pretraining_mode_skips_the_error_predictor() {
        let mut cfg = config();
        cfg.fit_error_predictor = false;
        tch::manual_seed(0);
        let networks = DeupNetworks { f_predictor: mlp(16, 2), e_predictor: None };
        let mut est = DeupEstimator::new(networks, SignalSources::default(), cfg, device()).unwrap();

        let train = images(16, 0.0);
        let report = est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 1, None).unwrap();
        assert!(report.history[0].e_loss.is_none());
        assert!(report.final_f_loss().unwrap().is_finite());
        let xs = Tensor::zeros([2, 1, 4, 4], (Kind::Float, device()));
        assert!(matches!(est.predict_uncertainty(&xs), Err(DeupError::NotFitted { .. })));
        assert_eq!(est.predict(&xs).unwrap().size(), vec![2, 2]);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    #[test]
    fn weights_and_history_are_written() {
        let tmp = tempfile::tempdir().unwrap();
        let train = images(16, 0.0);
        let mut est = estimator(config());
        est.fit(&DeupData::new(DataLoader::new(&train, 8, true, 0)), 1, None).unwrap();

        let f_path = tmp.path().join("f.ot");
        let e_path = tmp.path().join("e.ot");
        let h_path = tmp.path().join("runs").join("history.json");
        est.save_main_predictor(&f_path).unwrap();
        est.save_error_predictor(&e_path).unwrap();
        est.save_history(&h_path).unwrap();
        assert!(f_path.exists() && e_path.exists());

        let history: Vec<EpochRecord> = serde_json::from_str(&std::fs::read_to_string(&h_path).unwrap()).unwrap();
        assert_eq!(history.len(), 1);

        let mut restored = Mlp::new(
            MlpSpec {
                input_dim: 16,
                output_dim: 2,
                hidden_size: 16,
                n_hidden: 1,
                activation: Activation::Relu,
                output: OutputActivation::Sigmoid,
            },
            device(),
        );
        restored.load(&f_path).unwrap();
        let xs = Tensor::ones([2, 1, 4, 4], (Kind::Float, device()));
        let diff = (restored.forward_inference(&xs, None).unwrap() - est.predict(&xs).unwrap())
            .abs()
            .max()
            .double_value(&[]);
        assert!(diff < 1e-6);
    }
}

#[cfg(not(feature = "tch-backend"))]
#[test]
fn tch_backend_not_enabled() {}
