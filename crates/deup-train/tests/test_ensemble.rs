//! Integration tests for [`deup_train::ensemble`].
//!
//! Replicas are small MLPs; identical initialisations are produced by
//! re-seeding libtorch before each construction.

#[cfg(feature = "tch-backend")]
mod tch_tests {
    use deup_train::config::EnsembleConfig;
    use deup_train::ensemble::Ensemble;
    use deup_train::error::DeupError;
    use deup_train::model::{Activation, Mlp, MlpSpec, OutputActivation, Predictor};
    use tch::{Kind, Tensor};

    fn device() -> tch::Device {
        tch::Device::Cpu
    }

    fn replica(seed: i64) -> Box<dyn Predictor> {
        tch::manual_seed(seed);
        Box::new(Mlp::new(
            MlpSpec {
                input_dim: 3,
                output_dim: 1,
                hidden_size: 16,
                n_hidden: 2,
                activation: Activation::Tanh,
                output: OutputActivation::Identity,
            },
            device(),
        ))
    }

    /// `y = sin(x0) + x1 * x2` on a fixed grid.
    fn observations(n: i64) -> (Tensor, Tensor) {
        let x = Tensor::linspace(-2.0, 2.0, n * 3, (Kind::Float, device())).view([n, 3]);
        let y = (x.select(1, 0).sin() + x.select(1, 1) * x.select(1, 2)).unsqueeze(1);
        (x, y)
    }

    fn ensemble(seeds: &[i64]) -> Ensemble {
        let (x, y) = observations(24);
        let replicas = seeds.iter().map(|&s| replica(s)).collect();
        Ensemble::new(&x, &y, replicas, &EnsembleConfig::default(), device()).unwrap()
    }

    #[test]
    fn prediction_requires_fit() {
        let mut ens = ensemble(&[1, 2, 3]);
        let (x, _) = observations(4);
        assert!(matches!(ens.prediction_with_uncertainty(&x), Err(DeupError::NotFitted { .. })));
        assert!(matches!(ens.posterior(&x), Err(DeupError::NotFitted { .. })));

        let losses = ens.fit().unwrap();
        assert_eq!(losses.len(), 3);
        assert!(losses.iter().all(|l| l.is_finite()));
        assert!(ens.prediction_with_uncertainty(&x).is_ok());
    }

    #[test]
    fn identical_replicas_do_not_disagree() {
        let mut ens = ensemble(&[7, 7, 7]);
        ens.fit().unwrap();
        ens.fit().unwrap();
        let (x, _) = observations(10);
        let (_, var) = ens.prediction_with_uncertainty(&x).unwrap();
        assert!(var.max().double_value(&[]) < 1e-10);
    }

    #[test]
    fn distinct_replicas_have_non_negative_variance() {
        let mut ens = ensemble(&[1, 2, 3, 4]);
        ens.fit().unwrap();
        let (x, _) = observations(10);
        let (mean, var) = ens.prediction_with_uncertainty(&x).unwrap();
        assert_eq!(mean.size(), vec![10, 1]);
        assert_eq!(var.size(), vec![10, 1]);
        assert!(var.min().double_value(&[]) >= 0.0);
        assert!(var.max().double_value(&[]) > 0.0);
    }

    #[test]
    fn pseudo_batches_match_flat_scoring() {
        let mut ens = ensemble(&[1, 2]);
        ens.fit().unwrap();
        let (flat, _) = observations(12);
        let batched = flat.view([4, 3, 3]);

        let (m3, v3) = ens.prediction_with_uncertainty(&batched).unwrap();
        assert_eq!(m3.size(), vec![4, 3, 1]);
        assert_eq!(v3.size(), vec![4, 3, 1]);

        let (m2, v2) = ens.prediction_with_uncertainty(&flat).unwrap();
        let dm = (m3.view([12, 1]) - m2).abs().max().double_value(&[]);
        let dv = (v3.view([12, 1]) - v2).abs().max().double_value(&[]);
        assert!(dm < 1e-6 && dv < 1e-6);
    }

    #[test]
    fn posterior_shapes_follow_the_input() {
        let mut ens = ensemble(&[1, 2]);
        ens.fit().unwrap();
        let (flat, _) = observations(6);

        let post = ens.posterior(&flat).unwrap();
        assert_eq!(post.mean().size(), vec![6]);
        assert_eq!(post.covariance().size(), vec![6, 6]);

        let post = ens.posterior(&flat.view([2, 3, 3])).unwrap();
        assert_eq!(post.mean().size(), vec![2, 3]);
        assert_eq!(post.covariance().size(), vec![2, 3, 3]);
        assert!(post.variance().min().double_value(&[]) > 0.0);
    }

    #[test]
    fn empty_queries_give_empty_predictions() {
        let mut ens = ensemble(&[1, 2]);
        ens.fit().unwrap();

        let (mean, var) = ens.prediction_with_uncertainty(&Tensor::zeros([0, 3], (Kind::Float, device()))).unwrap();
        assert_eq!(mean.size(), vec![0, 1]);
        assert_eq!(var.size(), vec![0, 1]);

        let (mean, var) = ens.prediction_with_uncertainty(&Tensor::zeros([0, 4, 3], (Kind::Float, device()))).unwrap();
        assert_eq!(mean.size(), vec![0, 4, 1]);
        assert_eq!(var.size(), vec![0, 4, 1]);

        let post = ens.posterior(&Tensor::zeros([0, 3], (Kind::Float, device()))).unwrap();
        assert_eq!(post.mean().size(), vec![0]);
    }

    #[test]
    fn epoch_counts_fit_calls() {
        let mut ens = ensemble(&[1]);
        assert_eq!(ens.epoch(), 0);
        ens.fit().unwrap();
        ens.fit().unwrap();
        assert_eq!(ens.epoch(), 2);
        assert!(ens.is_fitted());
    }

    #[test]
    fn mismatched_replica_output_is_rejected() {
        let (x, y) = observations(8);
        let y2 = Tensor::cat(&[&y, &y], 1);
        let err = Ensemble::new(&x, &y2, vec![replica(1)], &EnsembleConfig::default(), device()).err().unwrap();
        assert!(matches!(err, DeupError::Config(_)));
    }
}

#[cfg(not(feature = "tch-backend"))]
#[test]
fn tch_backend_not_enabled() {}
