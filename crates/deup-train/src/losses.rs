//! Loss functions for DEUP training.
//!
//! - **Main losses** ([`per_example_loss`]): BCE on sigmoid class scores,
//!   softmax cross-entropy on logits, or squared error against one-hot labels.
//!   All keep one value per example so the same tensor can supervise the
//!   error predictor.
//! - **Error targets** ([`error_targets`]): map realized per-example losses to
//!   the label range of the error loss.
//! - **Error loss** ([`error_predictor_loss`]): element-wise BCE or MSE,
//!   averaged manually.
//!
//! ```text
//! target_bce(ℓ) = 1 − exp(−ℓ)   ∈ [0, 1)
//! target_mse(ℓ) = ℓ             ∈ [0, ∞)
//! ```

use tch::{Kind, Reduction, Tensor};

use crate::config::{ErrorLoss, LossKind};
use crate::error::{DeupError, DeupResult};
use crate::tensor::one_hot;

/// Probabilities are clamped into `[EPS, 1 − EPS]` before taking logs.
const EPS: f64 = 1e-6;

// ─────────────────────────────────────────────────────────────────────────────
// Main predictor
// ─────────────────────────────────────────────────────────────────────────────

/// Per-example loss of `output` (`[B, C]`) against integer `labels` (`[B]`).
///
/// Returns a `[B]` tensor that stays attached to the graph of `output`.
pub fn per_example_loss(kind: LossKind, output: &Tensor, labels: &Tensor) -> DeupResult<Tensor> {
    let size = output.size();
    if size.len() != 2 {
        return Err(DeupError::shape_mismatch(vec![-1, -1], size));
    }
    let num_classes = size[1];
    let loss = match kind {
        LossKind::Bce => {
            let target = one_hot(labels, num_classes);
            output
                .clamp(EPS, 1.0 - EPS)
                .binary_cross_entropy::<Tensor>(&target, None, Reduction::None)
                .mean_dim(&[1_i64][..], false, Kind::Float)
        }
        // weight=None, ignore_index=-100, label_smoothing=0.0
        LossKind::CrossEntropy => output.cross_entropy_loss::<Tensor>(labels, None, Reduction::None, -100, 0.0),
        LossKind::Mse => {
            let target = one_hot(labels, num_classes);
            output.mse_loss(&target, Reduction::None).mean_dim(&[1_i64][..], false, Kind::Float)
        }
    };
    Ok(loss)
}

/// Predicted class per example.
pub fn predicted_classes(output: &Tensor) -> Tensor {
    output.argmax(1, false)
}

// ─────────────────────────────────────────────────────────────────────────────
// Error predictor
// ─────────────────────────────────────────────────────────────────────────────

/// Error targets derived from detached per-example losses.
///
/// Always non-negative; for [`ErrorLoss::Bce`] also strictly below one.
pub fn error_targets(kind: ErrorLoss, losses: &Tensor) -> Tensor {
    let l = losses.detach().to_kind(Kind::Float).clamp_min(0.0);
    match kind {
        ErrorLoss::Bce => 1.0 - (-l).exp(),
        ErrorLoss::Mse => l,
    }
}

/// Scalar loss of error-predictor outputs (`[B]` or `[B, 1]`) against targets.
pub fn error_predictor_loss(kind: ErrorLoss, predicted: &Tensor, targets: &Tensor) -> Tensor {
    let p = predicted.view([-1]);
    let t = targets.view([-1]).to_kind(Kind::Float);
    let per_example = match kind {
        ErrorLoss::Bce => p.clamp(EPS, 1.0 - EPS).binary_cross_entropy::<Tensor>(&t, None, Reduction::None),
        ErrorLoss::Mse => p.mse_loss(&t, Reduction::None),
    };
    per_example.mean(Kind::Float)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn labels(v: &[i64]) -> Tensor {
        Tensor::from_slice(v)
    }

    #[test]
    fn bce_is_small_for_confident_correct_scores() {
        let out = Tensor::from_slice(&[0.999f32, 0.001, 0.001, 0.999]).view([2, 2]);
        let l = per_example_loss(LossKind::Bce, &out, &labels(&[0, 1])).unwrap();
        assert_eq!(l.size(), vec![2]);
        assert!(l.max().double_value(&[]) < 0.01);
    }

    #[test]
    fn cross_entropy_keeps_batch_axis() {
        let out = Tensor::zeros([3, 4], (Kind::Float, Device::Cpu));
        let l = per_example_loss(LossKind::CrossEntropy, &out, &labels(&[0, 1, 2])).unwrap();
        assert_eq!(l.size(), vec![3]);
        assert!((l.double_value(&[0]) - 4f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn brier_loss_of_exact_one_hot_is_zero() {
        let out = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 1.0]).view([2, 2]);
        let l = per_example_loss(LossKind::Mse, &out, &labels(&[0, 1])).unwrap();
        assert!(l.abs().max().double_value(&[]) < 1e-7);
    }

    #[test]
    fn one_dimensional_output_is_rejected() {
        let out = Tensor::zeros([3], (Kind::Float, Device::Cpu));
        assert!(per_example_loss(LossKind::Bce, &out, &labels(&[0, 1, 2])).is_err());
    }

    #[test]
    fn bce_targets_lie_in_unit_interval() {
        let losses = Tensor::from_slice(&[0.0f32, 0.5, 3.0, 50.0]);
        let t = error_targets(ErrorLoss::Bce, &losses);
        assert!(t.min().double_value(&[]) >= 0.0);
        assert!(t.max().double_value(&[]) <= 1.0);
        assert!(t.double_value(&[0]).abs() < 1e-7);
    }

    #[test]
    fn mse_targets_are_raw_losses() {
        let losses = Tensor::from_slice(&[0.25f32, 2.0]);
        let t = error_targets(ErrorLoss::Mse, &losses);
        assert!((t.double_value(&[1]) - 2.0).abs() < 1e-7);
    }

    #[test]
    fn error_loss_is_scalar() {
        let p = Tensor::from_slice(&[0.2f32, 0.8]).view([2, 1]);
        let t = Tensor::from_slice(&[0.2f32, 0.8]);
        let l = error_predictor_loss(ErrorLoss::Mse, &p, &t);
        assert_eq!(l.size(), Vec::<i64>::new());
        assert!(l.double_value(&[]).abs() < 1e-10);
    }
}
