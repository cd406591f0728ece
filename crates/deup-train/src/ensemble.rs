//! Deep-ensemble baseline.
//!
//! An [`Ensemble`] trains several independently initialised regressors on
//! one shared shuffled batch stream and reports the mean and the variance of
//! their predictions. The variance is the ensemble's uncertainty estimate.
//!
//! ```text
//!   x [n, d] ──┬─► replica 0 ─┐
//!              ├─► replica 1 ─┼─► stack [R, n, 1] ─► mean, var over R
//!              └─► replica k ─┘
//! ```
//!
//! Pseudo-batched inputs `[n, q, d]` are flattened to `[n·q, d]` and the
//! results reshaped back to `[n, q, 1]`.

use tch::{Device, Kind, Reduction, Tensor};
use tracing::{debug, info};

use crate::config::EnsembleConfig;
use crate::dataset::{epoch_seed, shuffled_indices};
use crate::error::{ConfigError, DeupError, DeupResult};
use crate::model::Predictor;
use crate::optim::ScheduledOptimizer;
use crate::tensor::{ensure_finite, finite_scalar};

/// Jitter added to posterior variances.
pub const POSTERIOR_JITTER: f64 = 1e-6;

// ---------------------------------------------------------------------------
// DiagonalGaussian
// ---------------------------------------------------------------------------

/// Gaussian with independent coordinates.
///
/// `mean` is `[n]` or `[n, q]`; `variance` has the same shape.
#[derive(Debug)]
pub struct DiagonalGaussian {
    mean: Tensor,
    variance: Tensor,
}

impl DiagonalGaussian {
    /// Mean vector (or batch of vectors).
    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Per-coordinate variance.
    pub fn variance(&self) -> &Tensor {
        &self.variance
    }

    /// Dense covariance: `[n, n]` for a `[n]` mean, `[n, q, q]` for `[n, q]`.
    pub fn covariance(&self) -> Tensor {
        self.variance.diag_embed(0, -2, -1)
    }
}

// ---------------------------------------------------------------------------
// Ensemble
// ---------------------------------------------------------------------------

/// Replicas trained on shared data, scored by their disagreement.
pub struct Ensemble {
    train_x: Tensor,
    train_y: Tensor,
    replicas: Vec<Box<dyn Predictor>>,
    optimizers: Vec<ScheduledOptimizer>,
    requested_batch_size: usize,
    batch_size: usize,
    seed: u64,
    device: Device,
    epoch: usize,
    fitted: bool,
}

impl Ensemble {
    /// Build an ensemble over `train_x` `[n, d]` and `train_y` `[n, k]`.
    ///
    /// Every replica gets its own optimizer (and schedule) built from
    /// `config`. The batch size is capped at `n / 2`.
    pub fn new(
        train_x: &Tensor,
        train_y: &Tensor,
        replicas: Vec<Box<dyn Predictor>>,
        config: &EnsembleConfig,
        device: Device,
    ) -> DeupResult<Self> {
        config.validate()?;
        if replicas.is_empty() {
            return Err(ConfigError::invalid_value("replicas", "at least one replica is required").into());
        }
        let (n, k) = check_observations(train_x, train_y)?;
        if n < 2 {
            return Err(ConfigError::invalid_value("train_x", format!("need at least 2 examples, got {n}")).into());
        }
        if let Some(r) = replicas.iter().find(|r| r.output_width() != k) {
            return Err(ConfigError::invalid_value(
                "replicas",
                format!("{} produces {} outputs but targets have {k}", r.name(), r.output_width()),
            )
            .into());
        }
        let optimizers = replicas
            .iter()
            .map(|r| ScheduledOptimizer::new(r.var_store(), &config.optimizer, config.scheduler.as_ref()))
            .collect::<DeupResult<Vec<_>>>()?;

        let batch_size = config.batch_size.min(n / 2);
        info!("Ensemble: {} replicas, {n} observations, batch size {batch_size}", replicas.len());
        Ok(Ensemble {
            train_x: train_x.to_device(device).to_kind(Kind::Float),
            train_y: train_y.to_device(device).to_kind(Kind::Float),
            replicas,
            optimizers,
            requested_batch_size: config.batch_size,
            batch_size,
            seed: config.seed,
            device,
            epoch: 0,
            fitted: false,
        })
    }

    /// Number of `fit` calls so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Whether `fit` has completed at least once.
    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    /// Effective mini-batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of replicas.
    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Number of stored observations.
    pub fn num_examples(&self) -> usize {
        self.train_x.size()[0] as usize
    }

    /// Output columns per prediction.
    pub fn num_outputs(&self) -> usize {
        self.train_y.size()[1] as usize
    }

    /// Append acquired observations and recompute the batch size.
    pub fn add_observations(&mut self, x: &Tensor, y: &Tensor) -> DeupResult<()> {
        let (_, k) = check_observations(x, y)?;
        let d = self.train_x.size()[1];
        if k != self.num_outputs() || x.size()[1] != d {
            return Err(DeupError::shape_mismatch(vec![-1, d, self.num_outputs() as i64], vec![x.size()[1], y.size()[1]]));
        }
        let x = x.to_device(self.device).to_kind(Kind::Float);
        let y = y.to_device(self.device).to_kind(Kind::Float);
        self.train_x = Tensor::cat(&[&self.train_x, &x], 0);
        self.train_y = Tensor::cat(&[&self.train_y, &y], 0);
        self.batch_size = self.requested_batch_size.min(self.num_examples() / 2);
        debug!("Ensemble now holds {} observations", self.num_examples());
        Ok(())
    }

    /// One pass over the data for every replica.
    ///
    /// Gradients are accumulated over the whole pass and each replica takes
    /// a single optimizer step. Returns the mean squared error per replica.
    pub fn fit(&mut self) -> DeupResult<Vec<f64>> {
        let n = self.num_examples();
        let order: Vec<i64> =
            shuffled_indices(n, epoch_seed(self.seed, self.epoch as u64)).into_iter().map(|i| i as i64).collect();
        let batches: Vec<(Tensor, Tensor, f64)> = order
            .chunks(self.batch_size.max(1))
            .map(|chunk| {
                let idx = Tensor::from_slice(chunk).to_device(self.device);
                (self.train_x.index_select(0, &idx), self.train_y.index_select(0, &idx), chunk.len() as f64 / n as f64)
            })
            .collect();

        let mut losses = Vec::with_capacity(self.replicas.len());
        for (replica, opt) in self.replicas.iter().zip(self.optimizers.iter_mut()) {
            opt.zero_grad();
            let mut total = 0.0;
            for (xi, yi, weight) in &batches {
                let y_hat = replica.forward_t(xi, None, true)?;
                let loss = y_hat.mse_loss(yi, Reduction::Mean);
                total += finite_scalar(&loss, "ensemble fit")? * weight;
                (loss * *weight).backward();
            }
            opt.step();
            opt.schedule_step();
            losses.push(total);
        }

        self.epoch += 1;
        self.fitted = true;
        debug!("Ensemble epoch {}: losses {losses:?}", self.epoch);
        Ok(losses)
    }

    /// Mean and variance across replicas.
    ///
    /// `[n, d]` gives `([n, k], [n, k])`; `[n, q, d]` gives
    /// `([n, q, k], [n, q, k])`.
    ///
    /// # Errors
    ///
    /// [`DeupError::NotFitted`] before the first `fit`.
    pub fn prediction_with_uncertainty(&self, x: &Tensor) -> DeupResult<(Tensor, Tensor)> {
        if !self.fitted {
            return Err(DeupError::not_fitted("ensemble"));
        }
        let x = x.to_device(self.device).to_kind(Kind::Float);
        match x.size().as_slice() {
            [_, _] => self.disagreement(&x),
            &[n, q, _] => {
                let (mean, var) = self.disagreement(&x.flatten(0, 1))?;
                let k = self.num_outputs() as i64;
                Ok((mean.view([n, q, k]), var.view([n, q, k])))
            }
            other => Err(DeupError::shape_mismatch(vec![-1, -1, -1], other.to_vec())),
        }
    }

    fn disagreement(&self, x: &Tensor) -> DeupResult<(Tensor, Tensor)> {
        let preds = self
            .replicas
            .iter()
            .map(|r| r.forward_inference(x, None))
            .collect::<DeupResult<Vec<_>>>()?;
        let stacked = Tensor::stack(&preds, 0);
        let mean = stacked.mean_dim(&[0_i64][..], false, Kind::Float);
        let var = (&stacked - mean.unsqueeze(0)).square().mean_dim(&[0_i64][..], false, Kind::Float);
        Ok((mean, var))
    }

    /// Gaussian posterior for single-output ensembles.
    ///
    /// # Errors
    ///
    /// [`DeupError::ShapeMismatch`] for multi-output ensembles and
    /// [`DeupError::Numerical`] when the mean or variance is not finite.
    pub fn posterior(&self, x: &Tensor) -> DeupResult<DiagonalGaussian> {
        if self.num_outputs() != 1 {
            return Err(DeupError::shape_mismatch(vec![1], vec![self.num_outputs() as i64]));
        }
        let (mean, var) = self.prediction_with_uncertainty(x)?;
        let mean = mean.squeeze_dim(-1);
        let variance = var.squeeze_dim(-1) + POSTERIOR_JITTER;
        ensure_finite(&mean, "ensemble posterior")?;
        ensure_finite(&variance, "ensemble posterior")?;
        Ok(DiagonalGaussian { mean, variance })
    }
}

fn check_observations(x: &Tensor, y: &Tensor) -> DeupResult<(usize, usize)> {
    match (x.size().as_slice(), y.size().as_slice()) {
        (&[n, _], &[m, k]) if n == m => Ok((n as usize, k as usize)),
        (xs, ys) => Err(DeupError::shape_mismatch(vec![-1, -1, -1, -1], [xs, ys].concat())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activation, Mlp, MlpSpec, OutputActivation};

    fn replica(seed: i64) -> Box<dyn Predictor> {
        tch::manual_seed(seed);
        Box::new(Mlp::new(
            MlpSpec {
                input_dim: 2,
                output_dim: 1,
                hidden_size: 8,
                n_hidden: 1,
                activation: Activation::Tanh,
                output: OutputActivation::Identity,
            },
            Device::Cpu,
        ))
    }

    fn data(n: i64) -> (Tensor, Tensor) {
        let x = Tensor::linspace(-1.0, 1.0, n * 2, (Kind::Float, Device::Cpu)).view([n, 2]);
        let y = x.sum_dim_intlist(&[1_i64][..], true, Kind::Float);
        (x, y)
    }

    #[test]
    fn batch_size_is_capped_at_half_the_data() {
        let (x, y) = data(10);
        let cfg = EnsembleConfig { batch_size: 16, ..EnsembleConfig::default() };
        let mut ens = Ensemble::new(&x, &y, vec![replica(1), replica(2)], &cfg, Device::Cpu).unwrap();
        assert_eq!(ens.batch_size(), 5);
        let (x2, y2) = data(6);
        ens.add_observations(&x2, &y2).unwrap();
        assert_eq!(ens.num_examples(), 16);
        assert_eq!(ens.batch_size(), 8);
    }

    #[test]
    fn single_example_is_rejected() {
        let (x, y) = data(1);
        let err = Ensemble::new(&x, &y, vec![replica(1)], &EnsembleConfig::default(), Device::Cpu);
        assert!(matches!(err, Err(DeupError::Config(_))));
    }

    #[test]
    fn posterior_covariance_is_diagonal() {
        let (x, y) = data(8);
        let mut ens = Ensemble::new(&x, &y, vec![replica(1), replica(2)], &EnsembleConfig::default(), Device::Cpu).unwrap();
        ens.fit().unwrap();
        let post = ens.posterior(&x).unwrap();
        assert_eq!(post.mean().size(), vec![8]);
        let cov = post.covariance();
        assert_eq!(cov.size(), vec![8, 8]);
        let off_diag = (&cov - cov.diagonal(0, 0, 1).diag_embed(0, -2, -1)).abs().sum(Kind::Float).double_value(&[]);
        assert_eq!(off_diag, 0.0);
        assert!(post.variance().min().double_value(&[]) >= POSTERIOR_JITTER * 0.5);
    }
}
