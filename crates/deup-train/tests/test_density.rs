//! Integration tests for [`deup_train::density`].
//!
//! Inputs are tiny (1x4x4) synthetic images so a MAF-MoG with 32 hidden
//! units fits in well under a second per test.

#[cfg(feature = "tch-backend")]
mod tch_tests {
    use deup_train::config::DensityConfig;
    use deup_train::dataset::{
        Batch, DataLoader, LabelSplit, LabeledDataset, Subset, SyntheticImageConfig, SyntheticImageDataset,
    };
    use deup_train::density::{DensityEstimator, MafMogDensityEstimator};
    use deup_train::error::DeupError;
    use deup_train::tensor::array_to_tensor;
    use tch::{Kind, Tensor};

    fn device() -> tch::Device {
        tch::Device::Cpu
    }

    fn images(n: usize, shift: f32) -> SyntheticImageDataset {
        SyntheticImageDataset::new(
            n,
            SyntheticImageConfig { channels: 1, height: 4, width: 4, shift, ..Default::default() },
        )
    }

    fn config() -> DensityConfig {
        DensityConfig {
            n_components: 3,
            hidden_size: 32,
            n_blocks: 2,
            n_hidden: 1,
            batch_size: 20,
            lr: 1e-3,
            epochs: 40,
            ..Default::default()
        }
    }

    fn all_inputs(ds: &dyn LabeledDataset) -> Tensor {
        let batch: Batch = DataLoader::new(ds, ds.len(), false, 0).iter_epoch(0).next().unwrap();
        array_to_tensor(&batch.inputs, device())
    }

    #[test]
    fn in_split_examples_score_higher_than_held_out_classes() {
        tch::manual_seed(0);
        let tmp = tempfile::tempdir().unwrap();
        let base = images(200, 0.0);
        let split = LabelSplit::new(0).unwrap();
        let inside_set = Subset::excluding_pair(&base, split);
        let held_out = Subset::with_pair(&base, split);

        let cfg = DensityConfig { epochs: 120, ..config() };
        let mut est = MafMogDensityEstimator::new(cfg, inside_set.input_dim(), device()).unwrap();
        est.fit(&inside_set, &tmp.path().join("mafmog.ot")).unwrap();

        let inside = est.score(&all_inputs(&inside_set)).unwrap().mean(Kind::Float).double_value(&[]);
        let outside = est.score(&all_inputs(&held_out)).unwrap().mean(Kind::Float).double_value(&[]);
        assert!(inside > outside, "in-split {inside} should exceed held-out classes {outside}");
    }

    #[test]
    fn empty_batch_scores_to_an_empty_tensor() {
        tch::manual_seed(3);
        let tmp = tempfile::tempdir().unwrap();
        let ds = images(20, 0.0);
        let mut est = MafMogDensityEstimator::new(DensityConfig { epochs: 1, ..config() }, 16, device()).unwrap();
        est.fit(&ds, &tmp.path().join("mafmog.ot")).unwrap();
        let s = est.score(&Tensor::zeros([0, 1, 4, 4], (Kind::Float, device()))).unwrap();
        assert_eq!(s.size(), vec![0]);
    }

    #[test]
    fn scaled_training_scores_span_the_unit_interval() {
        tch::manual_seed(1);
        let tmp = tempfile::tempdir().unwrap();
        let ds = images(40, 0.0);
        let mut est = MafMogDensityEstimator::new(DensityConfig { epochs: 3, ..config() }, 16, device()).unwrap();
        est.fit(&ds, &tmp.path().join("mafmog.ot")).unwrap();

        let s = est.score(&all_inputs(&ds)).unwrap();
        assert_eq!(s.size(), vec![40]);
        assert!(s.min().double_value(&[]) > -1e-4);
        assert!(s.max().double_value(&[]) < 1.0 + 1e-4);
    }

    #[test]
    fn saved_estimator_reloads_with_identical_scores() {
        tch::manual_seed(2);
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("mafmog.ot");
        let ds = images(40, 0.0);
        let cfg = DensityConfig { epochs: 2, ..config() };

        let mut est = MafMogDensityEstimator::new(cfg.clone(), 16, device()).unwrap();
        est.fit(&ds, &path).unwrap();
        let mut reloaded = MafMogDensityEstimator::new(cfg, 16, device()).unwrap();
        assert!(!reloaded.is_fitted());
        reloaded.load(&path).unwrap();

        let x = all_inputs(&ds);
        let diff = (est.score(&x).unwrap() - reloaded.score(&x).unwrap()).abs().max().double_value(&[]);
        assert!(diff < 1e-5);
    }

    #[test]
    fn wrong_input_width_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = images(10, 0.0);
        let mut est = MafMogDensityEstimator::new(config(), 9, device()).unwrap();
        let err = est.fit(&ds, &tmp.path().join("m.ot")).unwrap_err();
        assert!(matches!(err, DeupError::ShapeMismatch { .. }));
    }
}

#[cfg(not(feature = "tch-backend"))]
#[test]
fn tch_backend_not_enabled() {}
