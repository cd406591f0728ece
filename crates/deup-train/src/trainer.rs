//! DEUP training loop orchestrator.
//!
//! [`DeupEstimator`] owns the main predictor `f`, the error predictor `e`,
//! their optimizers and schedules, and the [`FeatureComposer`] that turns
//! fitted signal sources into error-predictor inputs. Each epoch runs the
//! phases
//!
//! ```text
//! Init ─► FitMain ─► ComputeErrorTargets ─► FitError ─► Validate ─► (schedule step)
//!            ▲                                                          │
//!            └──────────────────────── next epoch ◄─────────────────────┘
//!                                                     last epoch ─► Done
//! ```
//!
//! Error targets are recomputed from the current `f` at every epoch and are
//! dropped at the end of it. The epoch counter survives across
//! [`DeupEstimator::fit`] calls, so a second call continues where the first
//! stopped.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};
use tracing::{debug, info};

use crate::config::DeupConfig;
use crate::dataset::DataLoader;
use crate::density::DensityEstimator;
use crate::error::{ConfigError, DeupError, DeupResult};
use crate::features::FeatureComposer;
use crate::losses::{error_predictor_loss, error_targets, per_example_loss, predicted_classes};
use crate::metrics::{EpochRecord, ValidationAccumulator, ValidationReport};
use crate::model::Predictor;
use crate::optim::ScheduledOptimizer;
use crate::tensor::{batch_to_tensors, finite_scalar, tensor_to_indices, tensor_to_vec};
use crate::variance::VarianceSource;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Networks handed to the orchestrator.
pub struct DeupNetworks {
    /// Main predictor `f`.
    pub f_predictor: Box<dyn Predictor>,
    /// Error predictor `e`; required when `fit_error_predictor` is set.
    pub e_predictor: Option<Box<dyn Predictor>>,
}

/// Fitted signal sources consumed by the feature composer.
#[derive(Default)]
pub struct SignalSources {
    /// Density estimator for the `b` / `d` column.
    pub density: Option<Box<dyn DensityEstimator>>,
    /// Variance source for the `v` column.
    pub variance: Option<Box<dyn VarianceSource>>,
}

/// Loaders used by [`DeupEstimator::fit`].
pub struct DeupData<'a> {
    /// Shuffled training loader for `f`.
    pub train_loader: DataLoader<'a>,
    /// Loader whose examples supervise `e`; defaults to `train_loader`.
    pub error_loader: Option<DataLoader<'a>>,
    /// OOD examples scored during validation.
    pub ood_loader: Option<DataLoader<'a>>,
}

impl<'a> DeupData<'a> {
    /// Training data only.
    pub fn new(train_loader: DataLoader<'a>) -> Self {
        DeupData { train_loader, error_loader: None, ood_loader: None }
    }
}

// ---------------------------------------------------------------------------
// Phase / reports
// ---------------------------------------------------------------------------

/// Position of the orchestrator in its per-epoch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Constructed, no epoch run yet.
    Init,
    /// Updating `f`.
    FitMain,
    /// Computing error targets with `f` frozen.
    ComputeErrorTargets,
    /// Updating `e`.
    FitError,
    /// Evaluating without weight updates.
    Validate,
    /// The last `fit` call has finished.
    Done,
}

/// Summary of one [`DeupEstimator::fit`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    /// Epochs run by this call.
    pub epochs_run: usize,
    /// Epoch counter after the call.
    pub epoch: usize,
    /// Records produced by this call.
    pub history: Vec<EpochRecord>,
    /// Whether early stopping ended the call.
    pub stopped_early: bool,
}

impl FitReport {
    /// Main-predictor loss of the last epoch.
    pub fn final_f_loss(&self) -> Option<f64> {
        self.history.last().map(|r| r.f_loss)
    }
}

/// One batch of error-predictor supervision for the current epoch.
struct ErrorBatch {
    images: Option<Tensor>,
    features: Tensor,
    targets: Tensor,
}

// ---------------------------------------------------------------------------
// DeupEstimator
// ---------------------------------------------------------------------------

/// Joint trainer of a predictor and its error predictor.
pub struct DeupEstimator {
    f: Box<dyn Predictor>,
    e: Option<Box<dyn Predictor>>,
    f_opt: ScheduledOptimizer,
    e_opt: Option<ScheduledOptimizer>,
    composer: Option<FeatureComposer>,
    config: DeupConfig,
    device: Device,
    epoch: usize,
    phase: Phase,
    e_fitted: bool,
    history: Vec<EpochRecord>,
    best_validation: Option<ValidationReport>,
    stale_validations: usize,
}

impl DeupEstimator {
    /// Wire networks, optimizers, schedules and signal sources.
    ///
    /// Optimizers and schedules come from `config.optimizers` /
    /// `config.schedulers`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingOptimizer`] when a supplied network has no
    /// optimizer entry, [`ConfigError::OrphanScheduler`] when a schedule has
    /// no optimizer, and feature-mode or width errors when the error
    /// predictor cannot consume the composed features. All checks run before
    /// any batch is touched.
    pub fn new(networks: DeupNetworks, signals: SignalSources, config: DeupConfig, device: Device) -> DeupResult<Self> {
        config.validate()?;
        let DeupNetworks { f_predictor: f, e_predictor: e } = networks;

        let f_cfg = config
            .optimizers
            .f_optimizer
            .as_ref()
            .ok_or(ConfigError::missing_optimizer("f_predictor", "f_optimizer"))?;
        if config.schedulers.e_scheduler.is_some() && config.optimizers.e_optimizer.is_none() {
            return Err(ConfigError::OrphanScheduler { scheduler: "e_scheduler", optimizer: "e_optimizer" }.into());
        }
        let e_cfg = match (&e, &config.optimizers.e_optimizer) {
            (Some(_), None) => return Err(ConfigError::missing_optimizer("e_predictor", "e_optimizer").into()),
            (Some(_), Some(cfg)) => Some(cfg),
            (None, _) => None,
        };

        let composer = if config.fit_error_predictor || f.side_channel_width() > 0 {
            Some(FeatureComposer::new(config.feature_mode()?, signals.density, signals.variance)?)
        } else {
            None
        };
        if let Some(c) = &composer {
            let width = c.width();
            if config.fit_error_predictor {
                let e = e.as_deref().ok_or(ConfigError::invalid_value(
                    "e_predictor",
                    "fit_error_predictor is set but no error predictor was supplied",
                ))?;
                check_error_predictor(e, width)?;
            }
            if f.side_channel_width() > 0 && f.side_channel_width() != width {
                return Err(ConfigError::invalid_value(
                    "f_predictor",
                    format!("side channel width {} != feature width {width}", f.side_channel_width()),
                )
                .into());
            }
        }

        let f_opt = ScheduledOptimizer::new(f.var_store(), f_cfg, config.schedulers.f_scheduler.as_ref())?;
        let e_opt = match (&e, e_cfg) {
            (Some(e), Some(cfg)) => {
                Some(ScheduledOptimizer::new(e.var_store(), cfg, config.schedulers.e_scheduler.as_ref())?)
            }
            _ => None,
        };

        info!(
            "DEUP estimator: f={} ({} params), e={}, features={}",
            f.name(),
            f.num_parameters(),
            e.as_ref().map_or("none".to_string(), |e| format!("{} ({} params)", e.name(), e.num_parameters())),
            composer.as_ref().map_or("none".to_string(), |c| c.mode().to_string()),
        );

        Ok(DeupEstimator {
            f,
            e,
            f_opt,
            e_opt,
            composer,
            config,
            device,
            epoch: 0,
            phase: Phase::Init,
            e_fitted: false,
            history: Vec::new(),
            best_validation: None,
            stale_validations: 0,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Epochs completed since construction.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every epoch record since construction.
    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    /// The configuration in use.
    pub fn config(&self) -> &DeupConfig {
        &self.config
    }

    /// The main predictor.
    pub fn main_predictor(&self) -> &dyn Predictor {
        self.f.as_ref()
    }

    /// The error predictor, if any.
    pub fn error_predictor(&self) -> Option<&dyn Predictor> {
        self.e.as_deref()
    }

    /// The feature composer, if the error predictor is trained.
    pub fn composer(&self) -> Option<&FeatureComposer> {
        self.composer.as_ref()
    }

    /// Exclusive access to the composer, e.g. to refit a signal source
    /// between `fit` calls.
    pub fn composer_mut(&mut self) -> Option<&mut FeatureComposer> {
        self.composer.as_mut()
    }

    /// Current learning rate of the main predictor.
    pub fn f_lr(&self) -> f64 {
        self.f_opt.lr()
    }

    /// Current learning rate of the error predictor.
    pub fn e_lr(&self) -> Option<f64> {
        self.e_opt.as_ref().map(|o| o.lr())
    }

    // -----------------------------------------------------------------------
    // Inference
    // -----------------------------------------------------------------------

    fn features(&self, xs: &Tensor) -> DeupResult<Tensor> {
        self.composer.as_ref().ok_or(DeupError::not_fitted("feature composer"))?.compose(xs)
    }

    fn f_forward(&self, xs: &Tensor, train: bool) -> DeupResult<Tensor> {
        let side = if self.f.side_channel_width() > 0 { Some(self.features(xs)?) } else { None };
        self.f.forward_t(xs, side.as_ref(), train)
    }

    fn e_forward(&self, images: Option<&Tensor>, features: &Tensor, train: bool) -> DeupResult<Tensor> {
        let e = self.e.as_deref().ok_or(DeupError::not_fitted("error predictor"))?;
        let out = if e.side_channel_width() > 0 {
            let images = images.ok_or(DeupError::shape_mismatch(vec![-1, 3, -1, -1], vec![]))?;
            e.forward_t(images, Some(features), train)?
        } else {
            e.forward_t(features, None, train)?
        };
        Ok(out.view([-1]))
    }

    /// Main-predictor outputs in inference mode.
    pub fn predict(&self, xs: &Tensor) -> DeupResult<Tensor> {
        let xs = xs.to_device(self.device);
        tch::no_grad(|| self.f_forward(&xs, false))
    }

    /// Predicted error per example, `[B]`.
    ///
    /// # Errors
    ///
    /// [`DeupError::NotFitted`] until a FitError phase has completed.
    pub fn predict_uncertainty(&self, xs: &Tensor) -> DeupResult<Tensor> {
        if !self.e_fitted {
            return Err(DeupError::not_fitted("error predictor"));
        }
        let xs = xs.to_device(self.device);
        tch::no_grad(|| {
            let features = self.features(&xs)?;
            self.e_forward(Some(&xs), &features, false)
        })
    }

    /// Error targets of the current main predictor for `(xs, labels)`.
    pub fn error_targets(&self, xs: &Tensor, labels: &Tensor) -> DeupResult<Tensor> {
        let xs = xs.to_device(self.device);
        let labels = labels.to_device(self.device);
        tch::no_grad(|| {
            let out = self.f_forward(&xs, false)?;
            let losses = per_example_loss(self.config.main_loss, &out, &labels)?;
            Ok(error_targets(self.config.error_loss, &losses))
        })
    }

    // -----------------------------------------------------------------------
    // Training
    // -----------------------------------------------------------------------

    /// Run `epochs` epochs.
    ///
    /// Validation runs only when `val_loader` is given; the OOD loader in
    /// `data` only contributes to validation.
    pub fn fit(&mut self, data: &DeupData<'_>, epochs: usize, val_loader: Option<&DataLoader<'_>>) -> DeupResult<FitReport> {
        let first = self.history.len();
        self.stale_validations = 0;
        let mut stopped_early = false;
        info!("DEUP fit: {epochs} epochs starting at epoch {}", self.epoch);

        for _ in 0..epochs {
            let record = self.run_epoch(data, val_loader)?;
            info!("{}", record.summary());
            let validation = record.validation.clone();
            self.history.push(record);

            if let (Some(patience), Some(v)) = (self.config.early_stopping_patience, validation) {
                if self.best_validation.as_ref().map_or(true, |best| v.is_better_than(best)) {
                    self.best_validation = Some(v);
                    self.stale_validations = 0;
                } else {
                    self.stale_validations += 1;
                }
                if self.stale_validations >= patience {
                    info!("Early stopping after {} validations without improvement", self.stale_validations);
                    stopped_early = true;
                    break;
                }
            }
        }

        self.phase = Phase::Done;
        let history = self.history[first..].to_vec();
        Ok(FitReport { epochs_run: history.len(), epoch: self.epoch, history, stopped_early })
    }

    fn run_epoch(&mut self, data: &DeupData<'_>, val_loader: Option<&DataLoader<'_>>) -> DeupResult<EpochRecord> {
        let f_lr = self.f_opt.lr();
        let e_lr = self.e_opt.as_ref().map(|o| o.lr());

        self.phase = Phase::FitMain;
        let f_loss = self.fit_main(&data.train_loader)?;

        let e_loss = if self.config.fit_error_predictor {
            self.phase = Phase::ComputeErrorTargets;
            let loader = data.error_loader.as_ref().unwrap_or(&data.train_loader);
            let supervision = self.compute_error_targets(loader)?;

            self.phase = Phase::FitError;
            Some(self.fit_error(supervision)?)
        } else {
            None
        };

        let validation = match val_loader {
            Some(val) => {
                self.phase = Phase::Validate;
                self.validate(val, data.ood_loader.as_ref())?
            }
            None => None,
        };

        self.f_opt.schedule_step();
        if let Some(opt) = self.e_opt.as_mut() {
            opt.schedule_step();
        }
        self.epoch += 1;

        Ok(EpochRecord { epoch: self.epoch, f_loss, e_loss, f_lr, e_lr, validation })
    }

    fn fit_main(&mut self, loader: &DataLoader<'_>) -> DeupResult<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for batch in loader.iter_epoch(self.epoch as u64) {
            let (xs, labels) = batch_to_tensors(&batch, self.device);
            let out = self.f_forward(&xs, true)?;
            let loss = per_example_loss(self.config.main_loss, &out, &labels)?.mean(Kind::Float);
            let value = finite_scalar(&loss, "main predictor")?;
            self.f_opt.backward_step(&loss);
            total += value * batch.len() as f64;
            count += batch.len();
        }
        let mean = total / count.max(1) as f64;
        debug!("FitMain: {count} samples, loss={mean:.4}");
        Ok(mean)
    }

    fn compute_error_targets(&self, loader: &DataLoader<'_>) -> DeupResult<Vec<ErrorBatch>> {
        let keep_images = self.e.as_deref().is_some_and(|e| e.side_channel_width() > 0);
        let mut out = Vec::with_capacity(loader.num_batches());
        for batch in loader.iter_epoch(self.epoch as u64) {
            let (xs, labels) = batch_to_tensors(&batch, self.device);
            let targets = self.error_targets(&xs, &labels)?;
            let features = self.features(&xs)?;
            out.push(ErrorBatch { images: keep_images.then_some(xs), features, targets });
        }
        debug!("ComputeErrorTargets: {} batches", out.len());
        Ok(out)
    }

    fn fit_error(&mut self, supervision: Vec<ErrorBatch>) -> DeupResult<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for batch in &supervision {
            let pred = self.e_forward(batch.images.as_ref(), &batch.features, true)?;
            let loss = error_predictor_loss(self.config.error_loss, &pred, &batch.targets);
            let value = finite_scalar(&loss, "error predictor")?;
            let opt = self.e_opt.as_mut().ok_or(DeupError::not_fitted("error predictor optimizer"))?;
            opt.backward_step(&loss);
            let n = batch.targets.size()[0] as usize;
            total += value * n as f64;
            count += n;
        }
        self.e_fitted = true;
        let mean = total / count.max(1) as f64;
        debug!("FitError: {count} samples, loss={mean:.4}");
        Ok(mean)
    }

    fn validate(&self, val: &DataLoader<'_>, ood: Option<&DataLoader<'_>>) -> DeupResult<Option<ValidationReport>> {
        let mut acc = ValidationAccumulator::new();
        let with_e = self.e_fitted && self.composer.is_some();
        for batch in val.iter_epoch(0) {
            let (xs, labels) = batch_to_tensors(&batch, self.device);
            let out = tch::no_grad(|| self.f_forward(&xs, false))?;
            let losses = tch::no_grad(|| per_example_loss(self.config.main_loss, &out, &labels))?;
            acc.update(&tensor_to_indices(&predicted_classes(&out))?, &batch.labels, &tensor_to_vec(&losses)?);
            if with_e {
                acc.add_uncertainties(&tensor_to_vec(&self.predict_uncertainty(&xs)?)?);
            }
        }
        if let (true, Some(ood)) = (with_e, ood) {
            for batch in ood.iter_epoch(0) {
                let (xs, _) = batch_to_tensors(&batch, self.device);
                acc.add_ood_uncertainties(&tensor_to_vec(&self.predict_uncertainty(&xs)?)?);
            }
        }
        let report = acc.finalize();
        if let Some(r) = &report {
            debug!("Validate: {}", r.summary());
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Save the main predictor weights.
    pub fn save_main_predictor(&self, path: &Path) -> DeupResult<()> {
        create_parent(path)?;
        self.f.save(path)
    }

    /// Save the error predictor weights.
    pub fn save_error_predictor(&self, path: &Path) -> DeupResult<()> {
        let e = self.e.as_deref().ok_or(DeupError::not_fitted("error predictor"))?;
        create_parent(path)?;
        e.save(path)
    }

    /// Write the training history as pretty JSON.
    pub fn save_history(&self, path: &Path) -> DeupResult<()> {
        create_parent(path)?;
        std::fs::write(path, serde_json::to_string_pretty(&self.history)?)?;
        Ok(())
    }
}

fn check_error_predictor(e: &dyn Predictor, width: usize) -> Result<(), ConfigError> {
    if e.output_width() != 1 {
        return Err(ConfigError::invalid_value(
            "e_predictor",
            format!("must produce one output, got {}", e.output_width()),
        ));
    }
    if e.side_channel_width() > 0 {
        if e.side_channel_width() != width {
            return Err(ConfigError::invalid_value(
                "e_predictor",
                format!("side channel width {} != feature width {width}", e.side_channel_width()),
            ));
        }
        return Ok(());
    }
    match e.input_width() {
        Some(w) if w == width => Ok(()),
        Some(w) => Err(ConfigError::invalid_value("e_predictor", format!("input width {w} != feature width {width}"))),
        None => Err(ConfigError::invalid_value("e_predictor", "an image backbone needs a side channel for the features")),
    }
}

fn create_parent(path: &Path) -> DeupResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::model::{Activation, Mlp, MlpSpec, OutputActivation};

    fn mlp(input_dim: usize, output_dim: usize, output: OutputActivation) -> Box<dyn Predictor> {
        Box::new(Mlp::new(
            MlpSpec { input_dim, output_dim, hidden_size: 8, n_hidden: 1, activation: Activation::Relu, output },
            Device::Cpu,
        ))
    }

    #[test]
    fn missing_main_optimizer_is_rejected() {
        let mut cfg = DeupConfig::default();
        cfg.fit_error_predictor = false;
        cfg.optimizers.f_optimizer = None;
        cfg.schedulers.f_scheduler = None;
        let nets = DeupNetworks { f_predictor: mlp(4, 2, OutputActivation::Sigmoid), e_predictor: None };
        let err = DeupEstimator::new(nets, SignalSources::default(), cfg, Device::Cpu).err().unwrap();
        assert!(matches!(err, DeupError::Config(ConfigError::MissingOptimizer { network: "f_predictor", .. })));
    }

    #[test]
    fn orphan_error_scheduler_is_rejected() {
        let mut cfg = DeupConfig::default();
        cfg.fit_error_predictor = false;
        cfg.optimizers.e_optimizer = None;
        cfg.schedulers.e_scheduler = Some(crate::schedule::SchedulerConfig::Constant);
        let nets = DeupNetworks { f_predictor: mlp(4, 2, OutputActivation::Sigmoid), e_predictor: None };
        let err = DeupEstimator::new(nets, SignalSources::default(), cfg, Device::Cpu).err().unwrap();
        assert!(matches!(err, DeupError::Config(ConfigError::OrphanScheduler { .. })));
    }

    #[test]
    fn missing_signal_source_is_rejected() {
        let mut cfg = DeupConfig::default();
        cfg.features = "v".into();
        cfg.optimizers.e_optimizer = Some(OptimizerConfig::adam(1e-3));
        let nets = DeupNetworks {
            f_predictor: mlp(4, 2, OutputActivation::Sigmoid),
            e_predictor: Some(mlp(1, 1, OutputActivation::Sigmoid)),
        };
        let err = DeupEstimator::new(nets, SignalSources::default(), cfg, Device::Cpu).err().unwrap();
        assert!(matches!(err, DeupError::Config(ConfigError::MissingSignalSource { source_name: "variance source", .. })));
    }

    #[test]
    fn pretraining_without_error_predictor_starts_in_init() {
        let mut cfg = DeupConfig::default();
        cfg.fit_error_predictor = false;
        let nets = DeupNetworks { f_predictor: mlp(4, 2, OutputActivation::Sigmoid), e_predictor: None };
        let est = DeupEstimator::new(nets, SignalSources::default(), cfg, Device::Cpu).unwrap();
        assert_eq!(est.phase(), Phase::Init);
        assert_eq!(est.epoch(), 0);
        assert!(est.composer().is_none());
        let x = Tensor::zeros([2, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(est.predict_uncertainty(&x), Err(DeupError::NotFitted { .. })));
    }
}
