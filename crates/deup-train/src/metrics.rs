//! Evaluation metrics for DEUP training.
//!
//! This module provides:
//!
//! - **Accuracy / mean loss** of the main predictor on a validation loader.
//! - **Mean predicted uncertainty** of the error predictor.
//! - **AUROC** separating in-distribution from OOD uncertainty scores, with
//!   OOD as the positive class: a perfect uncertainty estimate scores every
//!   OOD example above every in-distribution example and reaches `1.0`.
//!
//! Results are accumulated over mini-batches via [`ValidationAccumulator`]
//! and finalized into a [`ValidationReport`] at the end of an epoch.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AUROC
// ---------------------------------------------------------------------------

/// Area under the ROC curve for scores where `positives` should rank higher.
///
/// Computed with the Mann-Whitney rank-sum statistic; tied scores receive the
/// average of their ranks, so a constant scorer yields `0.5`. Returns `None`
/// when either class is empty or a score is non-finite.
///
/// ```rust
/// use deup_train::metrics::roc_auc;
///
/// assert_eq!(roc_auc(&[0.1, 0.2], &[0.8, 0.9]), Some(1.0));
/// assert_eq!(roc_auc(&[0.5, 0.5], &[0.5]), Some(0.5));
/// ```
pub fn roc_auc(negatives: &[f64], positives: &[f64]) -> Option<f64> {
    if negatives.is_empty() || positives.is_empty() {
        return None;
    }
    if negatives.iter().chain(positives).any(|v| !v.is_finite()) {
        return None;
    }

    let mut scored: Vec<(f64, bool)> = negatives
        .iter()
        .map(|&s| (s, false))
        .chain(positives.iter().map(|&s| (s, true)))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut positive_rank_sum = 0.0f64;
    let mut i = 0usize;
    while i < scored.len() {
        let mut j = i;
        while j + 1 < scored.len() && scored[j + 1].0 == scored[i].0 {
            j += 1;
        }
        // Ranks are 1-based; ties share the mean rank of their run.
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        let n_pos = scored[i..=j].iter().filter(|(_, p)| *p).count();
        positive_rank_sum += avg_rank * n_pos as f64;
        i = j + 1;
    }

    let n_pos = positives.len() as f64;
    let n_neg = negatives.len() as f64;
    let u = positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0;
    Some(u / (n_pos * n_neg))
}

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

/// Aggregated results of one Validate phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Fraction of correctly classified validation samples.
    pub accuracy: f64,
    /// Mean per-example primary loss of the main predictor.
    pub mean_loss: f64,
    /// Mean error-predictor output on the validation set, when fitted.
    pub mean_uncertainty: Option<f64>,
    /// Mean error-predictor output on the OOD set, when supplied.
    pub mean_ood_uncertainty: Option<f64>,
    /// In-distribution vs OOD AUROC of the error predictor.
    pub ood_auroc: Option<f64>,
    /// Validation samples evaluated.
    pub num_samples: usize,
}

impl ValidationReport {
    /// Returns `true` when this report has a strictly lower validation loss.
    pub fn is_better_than(&self, other: &ValidationReport) -> bool {
        self.mean_loss < other.mean_loss
    }

    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "acc={:.4}  loss={:.4}  (n_samples={})",
            self.accuracy, self.mean_loss, self.num_samples
        );
        if let Some(u) = self.mean_uncertainty {
            s.push_str(&format!("  unc={u:.4}"));
        }
        if let Some(u) = self.mean_ood_uncertainty {
            s.push_str(&format!("  ood_unc={u:.4}"));
        }
        if let Some(a) = self.ood_auroc {
            s.push_str(&format!("  auroc={a:.4}"));
        }
        s
    }
}

// ---------------------------------------------------------------------------
// ValidationAccumulator
// ---------------------------------------------------------------------------

/// Running accumulator for validation metrics across mini-batches.
#[derive(Debug, Default, Clone)]
pub struct ValidationAccumulator {
    correct: usize,
    total: usize,
    loss_sum: f64,
    in_scores: Vec<f64>,
    ood_scores: Vec<f64>,
}

impl ValidationAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one validation batch.
    ///
    /// `predicted` and `labels` are class indices, `losses` the per-example
    /// primary loss. All slices must share a length; extra entries are ignored.
    pub fn update(&mut self, predicted: &[usize], labels: &[usize], losses: &[f32]) {
        let n = predicted.len().min(labels.len()).min(losses.len());
        self.correct += predicted[..n].iter().zip(&labels[..n]).filter(|(p, l)| p == l).count();
        self.loss_sum += losses[..n].iter().map(|&v| v as f64).sum::<f64>();
        self.total += n;
    }

    /// Record error-predictor outputs for in-distribution samples.
    pub fn add_uncertainties(&mut self, scores: &[f32]) {
        self.in_scores.extend(scores.iter().map(|&v| v as f64));
    }

    /// Record error-predictor outputs for OOD samples.
    pub fn add_ood_uncertainties(&mut self, scores: &[f32]) {
        self.ood_scores.extend(scores.iter().map(|&v| v as f64));
    }

    /// Samples accumulated via [`update`](Self::update).
    pub fn num_samples(&self) -> usize {
        self.total
    }

    /// Finalize into a report; `None` when no validation sample was seen.
    pub fn finalize(&self) -> Option<ValidationReport> {
        if self.total == 0 {
            return None;
        }
        let n = self.total as f64;
        Some(ValidationReport {
            accuracy: self.correct as f64 / n,
            mean_loss: self.loss_sum / n,
            mean_uncertainty: mean(&self.in_scores),
            mean_ood_uncertainty: mean(&self.ood_scores),
            ood_auroc: roc_auc(&self.in_scores, &self.ood_scores),
            num_samples: self.total,
        })
    }

    /// Reset to the empty state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

// ---------------------------------------------------------------------------
// EpochRecord
// ---------------------------------------------------------------------------

/// One entry of the training history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Epoch number, 1-based and continuous across `fit` calls.
    pub epoch: usize,
    /// Mean primary loss of the main predictor over the FitMain phase.
    pub f_loss: f64,
    /// Mean error-predictor loss over the FitError phase.
    pub e_loss: Option<f64>,
    /// Main predictor learning rate used during this epoch.
    pub f_lr: f64,
    /// Error predictor learning rate used during this epoch.
    pub e_lr: Option<f64>,
    /// Validation results, when a validation loader was supplied.
    pub validation: Option<ValidationReport>,
}

impl EpochRecord {
    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        let mut s = format!("epoch {:>3}  f_loss={:.4}  f_lr={:.2e}", self.epoch, self.f_loss, self.f_lr);
        if let Some(e) = self.e_loss {
            s.push_str(&format!("  e_loss={e:.4}"));
        }
        if let Some(v) = &self.validation {
            s.push_str("  | ");
            s.push_str(&v.summary());
        }
        s
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
