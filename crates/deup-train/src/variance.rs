//! Distance-based uncertainty with DUQ (Deterministic Uncertainty
//! Quantification).
//!
//! # Architecture
//!
//! ```text
//! x [B, C, S, S]
//!   │  3 × (Conv3x3 → BN → ReLU → MaxPool2)
//!   ▼
//! f(x) [B, out] ──► W_c f(x)  [B, centroid, classes]
//!                        │
//!                        ▼
//!   K_c(x) = exp(−mean((W_c f(x) − e_c)²) / (2 l²))   [B, classes]
//! ```
//!
//! Centroids `e_c = m_c / N_c` are exponential moving averages (decay
//! `gamma`) of the embeddings of class-`c` examples, refreshed after every
//! optimizer step. The loss is binary cross-entropy between `K` and one-hot
//! labels plus `l_gradient_penalty · (‖∇ₓ Σ K‖ − 1)²`.
//!
//! The uncertainty score is `1 − max_c K_c(x)`: near zero close to a
//! centroid, approaching one far from every class.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::nn::{self, ModuleT};
use tch::{Device, Kind, Reduction, Tensor};
use tracing::{debug, info, warn};

use crate::config::{OptimizerConfig, VarianceConfig};
use crate::dataset::DataLoader;
use crate::error::{ConfigError, DeupError, DeupResult};
use crate::optim::ScheduledOptimizer;
use crate::tensor::{batch_to_tensors, ensure_finite, finite_scalar, one_hot};

// ---------------------------------------------------------------------------
// VarianceSource trait
// ---------------------------------------------------------------------------

/// An auxiliary model producing a per-input uncertainty scalar.
pub trait VarianceSource {
    /// Train on `train_loader`, then evaluate on `val_loader` when given, and
    /// persist the parameters to `save_path`. Repeated calls continue from
    /// the current state.
    ///
    /// # Errors
    ///
    /// [`DeupError::Numerical`] for a non-finite loss. Non-convergence is not
    /// an error; see [`VarianceFitReport::ensure_converged`].
    fn fit(
        &mut self,
        train_loader: &DataLoader<'_>,
        save_path: &Path,
        val_loader: Option<&DataLoader<'_>>,
    ) -> DeupResult<VarianceFitReport>;

    /// Non-negative uncertainty per example, `[B]`.
    ///
    /// # Errors
    ///
    /// [`DeupError::NotFitted`] before a successful [`fit`](Self::fit).
    fn score(&self, xs: &Tensor) -> DeupResult<Tensor>;

    /// Whether a fit has completed.
    fn is_fitted(&self) -> bool;

    /// Discard all training and return to the freshly constructed state.
    fn reset(&mut self) -> DeupResult<()>;
}

/// Summary of one [`VarianceSource::fit`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceFitReport {
    /// Epochs run by this call.
    pub epochs: usize,
    /// Epochs run since construction or the last reset.
    pub total_epochs: usize,
    /// Mean loss of the last epoch.
    pub final_loss: f64,
    /// Training accuracy of the last epoch.
    pub train_accuracy: f64,
    /// Accuracy on the validation loader, when given.
    pub val_accuracy: Option<f64>,
    /// Whether `train_accuracy` reached the configured threshold.
    pub converged: bool,
}

impl VarianceFitReport {
    /// Turn non-convergence into a [`DeupError::Fitting`].
    pub fn ensure_converged(&self) -> DeupResult<()> {
        if self.converged {
            Ok(())
        } else {
            Err(DeupError::fitting(
                "variance source",
                format!("training accuracy {:.3} after {} epochs", self.train_accuracy, self.total_epochs),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// DuqVarianceSource
// ---------------------------------------------------------------------------

/// DUQ RBF-centroid classifier used as a variance source.
pub struct DuqVarianceSource {
    vs: nn::VarStore,
    features: nn::SequentialT,
    w: Tensor,
    n: Tensor,
    m: Tensor,
    opt: ScheduledOptimizer,
    config: VarianceConfig,
    epoch: usize,
    fitted: bool,
}

fn feature_extractor(p: &nn::Path, cfg: &VarianceConfig) -> nn::SequentialT {
    let conv = |name: &str, c_in: i64, c_out: i64| {
        nn::conv2d(p / name, c_in, c_out, 3, nn::ConvConfig { padding: 1, ..Default::default() })
    };
    let side = (cfg.input_size / 8) as i64;
    nn::seq_t()
        .add(conv("conv1", cfg.in_channels as i64, 64))
        .add(nn::batch_norm2d(p / "bn1", 64, Default::default()))
        .add_fn(|xs| xs.relu().max_pool2d_default(2))
        .add(conv("conv2", 64, 128))
        .add(nn::batch_norm2d(p / "bn2", 128, Default::default()))
        .add_fn(|xs| xs.relu().max_pool2d_default(2))
        .add(conv("conv3", 128, 128))
        .add(nn::batch_norm2d(p / "bn3", 128, Default::default()))
        .add_fn(|xs| xs.relu().max_pool2d_default(2).flatten(1, -1))
        .add(nn::linear(p / "fc", 128 * side * side, cfg.model_output_size as i64, Default::default()))
}

impl DuqVarianceSource {
    /// Build an unfitted source on `device`.
    pub fn new(config: VarianceConfig, device: Device) -> DeupResult<Self> {
        config.validate()?;
        let vs = nn::VarStore::new(device);
        let (features, w, n, m) = {
            let root = vs.root();
            let features = feature_extractor(&(&root / "features"), &config);
            let (c, k, out) = (config.centroid_size as i64, config.num_classes as i64, config.model_output_size as i64);
            let w = root.var("W", &[c, k, out], nn::Init::Randn { mean: 0.0, stdev: (2.0 / out as f64).sqrt() });
            let mut n = root.zeros_no_train("N", &[k]);
            let mut m = root.zeros_no_train("m", &[c, k]);
            tch::no_grad(|| {
                n.fill_(13.0);
                m.copy_(&(Tensor::randn([c, k], (Kind::Float, device)) * 0.05 * 13.0));
            });
            (features, w, n, m)
        };
        let opt = ScheduledOptimizer::new(
            &vs,
            &OptimizerConfig::sgd(config.lr, config.momentum, config.weight_decay),
            None,
        )?;
        Ok(DuqVarianceSource { vs, features, w, n, m, opt, config, epoch: 0, fitted: false })
    }

    /// Hyper-parameters.
    pub fn config(&self) -> &VarianceConfig {
        &self.config
    }

    /// Epochs trained since construction or the last reset.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Restore a source saved by [`VarianceSource::fit`].
    pub fn load(&mut self, path: &Path) -> DeupResult<()> {
        self.vs
            .load(path)
            .map_err(|e| DeupError::checkpoint(format!("cannot load variance source: {e}"), path))?;
        self.fitted = true;
        Ok(())
    }

    fn check_input(&self, xs: &Tensor) -> DeupResult<()> {
        let size = xs.size();
        let s = self.config.input_size as i64;
        let expected = [self.config.in_channels as i64, s, s];
        if size.len() != 4 || size[1..] != expected {
            let batch = size.first().copied().unwrap_or(-1);
            return Err(DeupError::shape_mismatch(vec![batch, expected[0], s, s], size));
        }
        Ok(())
    }

    /// Per-class embeddings `W_c f(x)`, `[B, centroid, classes]`.
    fn embed(&self, xs: &Tensor, train: bool) -> Tensor {
        let (c, k, out) = (self.config.centroid_size as i64, self.config.num_classes as i64, self.config.model_output_size as i64);
        let z = xs.apply_t(&self.features, train);
        let batch = z.size()[0];
        z.matmul(&self.w.view([c * k, out]).tr()).view([batch, c, k])
    }

    /// Kernel values from embeddings, `[B, classes]`.
    fn kernel(&self, embeddings: &Tensor) -> Tensor {
        let centroids = &self.m / self.n.unsqueeze(0);
        let diff = embeddings - centroids.unsqueeze(0);
        let l = self.config.length_scale;
        (diff.square().mean_dim(&[1_i64][..], false, Kind::Float) / (-2.0 * l * l)).exp()
    }

    /// Kernel values `K_c(x)` in inference mode, `[B, classes]`.
    pub fn predict(&self, xs: &Tensor) -> DeupResult<Tensor> {
        self.check_input(xs)?;
        let xs = xs.to_device(self.vs.device()).to_kind(Kind::Float);
        Ok(tch::no_grad(|| self.kernel(&self.embed(&xs, false))))
    }

    fn update_centroids(&mut self, xs: &Tensor, targets: &Tensor) {
        let gamma = self.config.gamma;
        let emb = tch::no_grad(|| self.embed(xs, true));
        let new_n = &self.n * gamma + targets.sum_dim_intlist(&[0_i64][..], false, Kind::Float) * (1.0 - gamma);
        let emb_sum = (emb * targets.unsqueeze(1)).sum_dim_intlist(&[0_i64][..], false, Kind::Float);
        let new_m = &self.m * gamma + emb_sum * (1.0 - gamma);
        tch::no_grad(|| {
            self.n.copy_(&new_n);
            self.m.copy_(&new_m);
        });
    }

    fn train_step(&mut self, xs: &Tensor, labels: &Tensor) -> DeupResult<(f64, i64)> {
        let k = self.config.num_classes as i64;
        let targets = one_hot(labels, k);
        let lambda = self.config.l_gradient_penalty;

        let xs = if lambda > 0.0 { xs.detach().set_requires_grad(true) } else { xs.shallow_clone() };
        let kernel = self.kernel(&self.embed(&xs, true));
        let mut loss = kernel.clamp(1e-6, 1.0 - 1e-6).binary_cross_entropy::<Tensor>(&targets, None, Reduction::Mean);
        if lambda > 0.0 {
            let grads = Tensor::run_backward(&[kernel.sum(Kind::Float)], &[&xs], true, true);
            let norm = (grads[0].flatten(1, -1).square().sum_dim_intlist(&[1_i64][..], false, Kind::Float) + 1e-12).sqrt();
            loss = loss + (norm - 1.0).square().mean(Kind::Float) * lambda;
        }
        let value = finite_scalar(&loss, "variance fit")?;
        self.opt.backward_step(&loss);
        let correct = kernel.argmax(1, false).eq_tensor(labels).sum(Kind::Int64).int64_value(&[]);

        self.update_centroids(&xs.detach(), &targets);
        Ok((value, correct))
    }

    fn accuracy(&self, loader: &DataLoader<'_>) -> DeupResult<Option<f64>> {
        let mut correct = 0i64;
        let mut total = 0usize;
        for batch in loader.iter_epoch(0) {
            let (xs, labels) = batch_to_tensors(&batch, self.vs.device());
            let kernel = self.predict(&xs)?;
            correct += kernel.argmax(1, false).eq_tensor(&labels).sum(Kind::Int64).int64_value(&[]);
            total += batch.len();
        }
        Ok((total > 0).then(|| correct as f64 / total as f64))
    }
}

impl VarianceSource for DuqVarianceSource {
    fn fit(
        &mut self,
        train_loader: &DataLoader<'_>,
        save_path: &Path,
        val_loader: Option<&DataLoader<'_>>,
    ) -> DeupResult<VarianceFitReport> {
        let max_label = train_loader.dataset().targets().into_iter().max();
        if let Some(l) = max_label.filter(|&l| l >= self.config.num_classes) {
            return Err(ConfigError::invalid_value("num_classes", format!("label {l} is out of range")).into());
        }
        info!(
            "Fitting DUQ on {} ({} samples, {} epochs, starting at epoch {})",
            train_loader.dataset().name(),
            train_loader.dataset().len(),
            self.config.epochs,
            self.epoch
        );

        let mut final_loss = f64::NAN;
        let mut train_accuracy = 0.0;
        for _ in 0..self.config.epochs {
            let mut loss_sum = 0.0;
            let mut correct = 0i64;
            let mut seen = 0usize;
            for batch in train_loader.iter_epoch(self.epoch as u64) {
                let (xs, labels) = batch_to_tensors(&batch, self.vs.device());
                self.check_input(&xs)?;
                let (loss, hits) = self.train_step(&xs, &labels)?;
                loss_sum += loss * batch.len() as f64;
                correct += hits;
                seen += batch.len();
            }
            self.epoch += 1;
            final_loss = loss_sum / seen.max(1) as f64;
            train_accuracy = correct as f64 / seen.max(1) as f64;
            debug!("duq epoch {:>3}  loss={final_loss:.4}  acc={train_accuracy:.4}", self.epoch);
        }
        self.fitted = true;

        let val_accuracy = match val_loader {
            Some(loader) => self.accuracy(loader)?,
            None => None,
        };

        if let Some(parent) = save_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.vs
            .save(save_path)
            .map_err(|e| DeupError::checkpoint(format!("cannot save variance source: {e}"), save_path))?;

        let converged = train_accuracy >= self.config.convergence_accuracy;
        if !converged {
            warn!(
                "DUQ did not converge: training accuracy {train_accuracy:.3} < {:.3}; keeping last state",
                self.config.convergence_accuracy
            );
        }
        Ok(VarianceFitReport {
            epochs: self.config.epochs,
            total_epochs: self.epoch,
            final_loss,
            train_accuracy,
            val_accuracy,
            converged,
        })
    }

    fn score(&self, xs: &Tensor) -> DeupResult<Tensor> {
        if !self.fitted {
            return Err(DeupError::not_fitted("variance source"));
        }
        let kernel = self.predict(xs)?;
        let s = (1.0 - kernel.amax(&[1_i64][..], false)).clamp_min(0.0);
        ensure_finite(&s, "variance score")?;
        Ok(s)
    }

    fn is_fitted(&self) -> bool {
        self.fitted
    }

    fn reset(&mut self) -> DeupResult<()> {
        *self = Self::new(self.config.clone(), self.vs.device())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
