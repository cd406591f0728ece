//! Density estimation with a masked autoregressive flow (MAF-MoG).
//!
//! # Architecture
//!
//! ```text
//! x [B, D]
//!   │
//!   ▼
//! ┌──────────────┐   u = (x − μ(x<d)) · exp(−log α(x<d))
//! │ MADE block 1 │   log|det J| = −Σ_d log α
//! └──────────────┘
//!   │ reverse order
//!   ▼
//!   ⋮  (n_blocks)
//!   │ reverse order
//!   ▼
//! ┌──────────────┐   per-dimension mixture of C Gaussians
//! │  MADE-MoG    │   log p(u) = Σ_d logsumexp_c(log π_c + log N(z_c) − log α_c)
//! └──────────────┘
//! ```
//!
//! Trained by maximum likelihood with Adam. Scores are log-densities (or
//! densities), optionally min-max scaled so the training set spans `[0, 1]`.
//! The scaling bounds are stored as non-trainable variables and persist with
//! the weights.

use std::f64::consts::PI;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use crate::config::{DensityConfig, OptimizerConfig};
use crate::dataset::{DataLoader, LabeledDataset};
use crate::error::{DatasetError, DeupError, DeupResult};
use crate::optim::ScheduledOptimizer;
use crate::tensor::{array_to_tensor, ensure_finite, finite_scalar, flatten_rows};

// ---------------------------------------------------------------------------
// DensityEstimator trait
// ---------------------------------------------------------------------------

/// An unsupervised model scoring how typical an input is.
pub trait DensityEstimator {
    /// Fit on every sample of `dataset` and persist the fitted parameters to
    /// `save_path`.
    ///
    /// # Errors
    ///
    /// [`DeupError::Numerical`] if the training loss becomes non-finite,
    /// [`DatasetError::Empty`] for an empty dataset.
    fn fit(&mut self, dataset: &dyn LabeledDataset, save_path: &Path) -> DeupResult<DensityFitReport>;

    /// One score per example; higher means more in-distribution.
    ///
    /// # Errors
    ///
    /// [`DeupError::NotFitted`] before a successful [`fit`](Self::fit).
    fn score(&self, xs: &Tensor) -> DeupResult<Tensor>;

    /// Whether a fit has completed.
    fn is_fitted(&self) -> bool;
}

/// Summary of a density fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityFitReport {
    /// Passes over the dataset.
    pub epochs: usize,
    /// Mean negative log-likelihood of the last epoch.
    pub final_nll: f64,
    /// Training samples.
    pub num_samples: usize,
    /// Lowest unscaled training score.
    pub score_min: f64,
    /// Highest unscaled training score.
    pub score_max: f64,
}

impl DensityFitReport {
    /// One-line summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "density fit: {} epochs on {} samples, nll={:.4}, score range [{:.3}, {:.3}]",
            self.epochs, self.num_samples, self.final_nll, self.score_min, self.score_max
        )
    }
}

// ---------------------------------------------------------------------------
// MADE
// ---------------------------------------------------------------------------

/// Autoregressive degrees of the hidden units.
fn hidden_degrees(dim: usize, hidden: usize) -> Vec<usize> {
    let span = dim.saturating_sub(1).max(1);
    (0..hidden).map(|k| k % span + 1).collect()
}

/// `mask[r, c] = 1` when row degree `>=` (or `>` if `strict`) column degree.
fn degree_mask(rows: &[usize], cols: &[usize], strict: bool, device: Device) -> Tensor {
    let data: Vec<f32> = rows
        .iter()
        .flat_map(|&r| cols.iter().map(move |&c| if (strict && r > c) || (!strict && r >= c) { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_slice(&data).view([rows.len() as i64, cols.len() as i64]).to_device(device)
}

#[derive(Debug)]
struct MaskedLinear {
    linear: nn::Linear,
    mask: Tensor,
}

impl MaskedLinear {
    fn new(p: nn::Path, mask: Tensor) -> Self {
        let size = mask.size();
        let linear = nn::linear(p, size[1], size[0], Default::default());
        MaskedLinear { linear, mask }
    }
}

impl Module for MaskedLinear {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.linear(&(&self.linear.ws * &self.mask), self.linear.bs.as_ref())
    }
}

/// Masked autoencoder whose output has `out_mult` blocks of `dim` columns;
/// column `j` only sees inputs with index `< j % dim`.
#[derive(Debug)]
struct Made {
    hidden: Vec<MaskedLinear>,
    out: MaskedLinear,
}

impl Made {
    fn new(p: &nn::Path, dim: usize, hidden_size: usize, n_hidden: usize, out_mult: usize, device: Device) -> Self {
        let in_deg: Vec<usize> = (1..=dim).collect();
        let h_deg = hidden_degrees(dim, hidden_size);
        let out_deg: Vec<usize> = (0..dim * out_mult).map(|j| j % dim + 1).collect();

        let mut hidden = Vec::with_capacity(n_hidden.max(1));
        hidden.push(MaskedLinear::new(p / "in", degree_mask(&h_deg, &in_deg, false, device)));
        for i in 1..n_hidden.max(1) {
            hidden.push(MaskedLinear::new(p / format!("h{i}"), degree_mask(&h_deg, &h_deg, false, device)));
        }
        let out = MaskedLinear::new(p / "out", degree_mask(&out_deg, &h_deg, true, device));
        Made { hidden, out }
    }

    fn net(&self, xs: &Tensor) -> Tensor {
        let h = self.hidden.iter().fold(xs.shallow_clone(), |h, layer| layer.forward(&h).relu());
        self.out.forward(&h)
    }
}

// ---------------------------------------------------------------------------
// MafMogDensityEstimator
// ---------------------------------------------------------------------------

/// MAF with a MADE mixture-of-Gaussians top block.
pub struct MafMogDensityEstimator {
    vs: nn::VarStore,
    blocks: Vec<Made>,
    mog: Made,
    score_min: Tensor,
    score_max: Tensor,
    config: DensityConfig,
    input_dim: usize,
    fitted: bool,
}

impl MafMogDensityEstimator {
    /// Build an unfitted estimator for inputs with `input_dim` scalar
    /// features on `device`.
    pub fn new(config: DensityConfig, input_dim: usize, device: Device) -> DeupResult<Self> {
        config.validate()?;
        if input_dim == 0 {
            return Err(DeupError::shape_mismatch(vec![-1], vec![0]));
        }
        let vs = nn::VarStore::new(device);
        let (blocks, mog, score_min, score_max) = {
            let root = vs.root();
            let blocks = (0..config.n_blocks)
                .map(|i| Made::new(&(&root / format!("made{i}")), input_dim, config.hidden_size, config.n_hidden, 2, device))
                .collect();
            let mog = Made::new(
                &(&root / "mog"),
                input_dim,
                config.hidden_size,
                config.n_hidden,
                3 * config.n_components,
                device,
            );
            let score_min = root.zeros_no_train("score_min", &[1]);
            let score_max = root.ones_no_train("score_max", &[1]);
            (blocks, mog, score_min, score_max)
        };
        Ok(MafMogDensityEstimator { vs, blocks, mog, score_min, score_max, config, input_dim, fitted: false })
    }

    /// Restore a fitted estimator saved by [`DensityEstimator::fit`].
    pub fn load(&mut self, path: &Path) -> DeupResult<()> {
        self.vs
            .load(path)
            .map_err(|e| DeupError::checkpoint(format!("cannot load density estimator: {e}"), path))?;
        self.fitted = true;
        Ok(())
    }

    /// Flattened input width.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Hyper-parameters.
    pub fn config(&self) -> &DensityConfig {
        &self.config
    }

    fn flatten(&self, xs: &Tensor) -> DeupResult<Tensor> {
        let flat = flatten_rows(&xs.to_device(self.vs.device()).to_kind(Kind::Float));
        let (batch, width) = (flat.size()[0], flat.size()[1]);
        if width != self.input_dim as i64 {
            return Err(DeupError::shape_mismatch(vec![batch, self.input_dim as i64], vec![batch, width]));
        }
        Ok(flat)
    }

    /// Exact log-density of flattened inputs, `[B]`.
    fn log_prob(&self, x: &Tensor) -> Tensor {
        let batch = x.size()[0];
        let dim = self.input_dim as i64;
        let c = self.config.n_components as i64;

        let mut u = x.shallow_clone();
        let mut log_det = Tensor::zeros([batch], (Kind::Float, x.device()));
        for block in &self.blocks {
            let out = block.net(&u);
            let m = out.narrow(1, 0, dim);
            let loga = out.narrow(1, dim, dim);
            u = ((&u - &m) * (-&loga).exp()).flip([1]);
            log_det = log_det - loga.sum_dim_intlist(&[1_i64][..], false, Kind::Float);
        }

        let out = self.mog.net(&u).view([batch, c, 3, dim]);
        let m = out.select(2, 0);
        let loga = out.select(2, 1);
        let logr = out.select(2, 2).log_softmax(1, Kind::Float);
        let z = (u.unsqueeze(1) - &m) * (-&loga).exp();
        let base = z.square() * -0.5 - 0.5 * (2.0 * PI).ln();
        let per_dim = (logr + base - loga).logsumexp(&[1_i64][..], false);
        per_dim.sum_dim_intlist(&[1_i64][..], false, Kind::Float) + log_det
    }

    fn raw_score(&self, x: &Tensor) -> Tensor {
        let lp = self.log_prob(x);
        if self.config.use_log_density {
            lp
        } else {
            lp.exp()
        }
    }

    fn train_epoch(&self, loader: &DataLoader<'_>, opt: &mut ScheduledOptimizer, epoch: usize) -> DeupResult<f64> {
        let mut total = 0.0f64;
        let mut count = 0usize;
        for batch in loader.iter_epoch(epoch as u64) {
            let x = self.flatten(&array_to_tensor(&batch.inputs, self.vs.device()))?;
            let loss = -self.log_prob(&x).mean(Kind::Float);
            let nll = finite_scalar(&loss, "density fit")?;
            opt.backward_step(&loss);
            total += nll * batch.len() as f64;
            count += batch.len();
        }
        Ok(total / count.max(1) as f64)
    }

    /// Unscaled min and max of the training scores.
    fn score_range(&self, dataset: &dyn LabeledDataset) -> DeupResult<(f64, f64)> {
        let loader = DataLoader::new(dataset, self.config.batch_size, false, 0);
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for batch in loader.iter_epoch(0) {
            let x = self.flatten(&array_to_tensor(&batch.inputs, self.vs.device()))?;
            let s = tch::no_grad(|| self.raw_score(&x));
            ensure_finite(&s, "density scaling")?;
            lo = lo.min(s.min().double_value(&[]));
            hi = hi.max(s.max().double_value(&[]));
        }
        Ok((lo, hi))
    }
}

impl DensityEstimator for MafMogDensityEstimator {
    fn fit(&mut self, dataset: &dyn LabeledDataset, save_path: &Path) -> DeupResult<DensityFitReport> {
        let n = dataset.len();
        if n == 0 {
            return Err(DatasetError::Empty { name: dataset.name().to_string() }.into());
        }
        if dataset.input_dim() != self.input_dim {
            return Err(DeupError::shape_mismatch(vec![self.input_dim as i64], vec![dataset.input_dim() as i64]));
        }

        let batch_size = self.config.batch_size.min(n);
        let loader = DataLoader::new(dataset, batch_size, true, self.config.seed);
        let mut opt = ScheduledOptimizer::new(&self.vs, &OptimizerConfig::adam(self.config.lr), None)?;
        info!(
            "Fitting MAF-MoG on {} ({n} samples, dim {}, batch {batch_size}, {} epochs)",
            dataset.name(),
            self.input_dim,
            self.config.epochs
        );

        let mut final_nll = f64::NAN;
        for epoch in 0..self.config.epochs {
            final_nll = self.train_epoch(&loader, &mut opt, epoch)?;
            debug!("density epoch {:>3}  nll={final_nll:.4}", epoch + 1);
        }

        let (score_min, score_max) = self.score_range(dataset)?;
        tch::no_grad(|| {
            self.score_min.copy_(&Tensor::from_slice(&[score_min as f32]));
            self.score_max.copy_(&Tensor::from_slice(&[score_max as f32]));
        });
        self.fitted = true;

        if let Some(parent) = save_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.vs
            .save(save_path)
            .map_err(|e| DeupError::checkpoint(format!("cannot save density estimator: {e}"), save_path))?;
        info!("MAF-MoG fitted: nll={final_nll:.4}  scores in [{score_min:.3}, {score_max:.3}]");

        Ok(DensityFitReport { epochs: self.config.epochs, final_nll, num_samples: n, score_min, score_max })
    }

    fn score(&self, xs: &Tensor) -> DeupResult<Tensor> {
        if !self.fitted {
            return Err(DeupError::not_fitted("density estimator"));
        }
        let x = self.flatten(xs)?;
        let s = tch::no_grad(|| {
            let raw = self.raw_score(&x);
            if self.config.use_density_scaling {
                let range = (&self.score_max - &self.score_min).clamp_min(1e-12);
                (raw - &self.score_min) / range
            } else {
                raw
            }
        });
        ensure_finite(&s, "density score")?;
        Ok(s)
    }

    fn is_fitted(&self) -> bool {
        self.fitted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
