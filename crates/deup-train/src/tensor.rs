//! Conversions between host-side `ndarray` batches and `tch` tensors.

use ndarray::ArrayD;
use tch::{Device, Kind, Tensor};

use crate::dataset::Batch;
use crate::error::{DeupError, DeupResult};

/// Copy an `f32` array onto `device`, keeping its shape.
pub fn array_to_tensor(array: &ArrayD<f32>, device: Device) -> Tensor {
    let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_slice(&data).view(shape.as_slice()).to_device(device)
}

/// Labels as an `Int64` tensor on `device`.
pub fn labels_to_tensor(labels: &[usize], device: Device) -> Tensor {
    let data: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
    Tensor::from_slice(&data).to_device(device)
}

/// `(inputs, labels)` tensors for one batch.
pub fn batch_to_tensors(batch: &Batch, device: Device) -> (Tensor, Tensor) {
    (array_to_tensor(&batch.inputs, device), labels_to_tensor(&batch.labels, device))
}

/// Copy any floating tensor back to the host as a flat `Vec<f32>`.
pub fn tensor_to_vec(t: &Tensor) -> DeupResult<Vec<f32>> {
    let flat = t.detach().to_device(Device::Cpu).to_kind(Kind::Float).flatten(0, -1);
    Ok(Vec::<f32>::try_from(&flat)?)
}

/// Copy an integer tensor back to the host as class indices.
pub fn tensor_to_indices(t: &Tensor) -> DeupResult<Vec<usize>> {
    let flat = t.detach().to_device(Device::Cpu).to_kind(Kind::Int64).flatten(0, -1);
    let raw = Vec::<i64>::try_from(&flat)?;
    Ok(raw.into_iter().map(|v| v.max(0) as usize).collect())
}

/// Return [`DeupError::Numerical`] unless every entry of `t` is finite.
pub fn ensure_finite(t: &Tensor, context: &'static str) -> DeupResult<()> {
    let finite = t.isfinite().all().to_kind(Kind::Int64).int64_value(&[]) == 1;
    if finite {
        Ok(())
    } else {
        let nan = t.isnan().sum(Kind::Int64).int64_value(&[]);
        Err(DeupError::numerical(context, format!("{nan} NaN entries in tensor of shape {:?}", t.size())))
    }
}

/// Scalar value of a loss, or [`DeupError::Numerical`] if it is not finite.
pub fn finite_scalar(loss: &Tensor, context: &'static str) -> DeupResult<f64> {
    let v = loss.double_value(&[]);
    if v.is_finite() {
        Ok(v)
    } else {
        Err(DeupError::numerical(context, format!("loss = {v}")))
    }
}

/// Collapse every axis after the first, `[B, ...] -> [B, D]`.
///
/// Unlike `reshape([B, -1])` this is defined for `B == 0`. Rank-1 input
/// becomes a single column.
pub fn flatten_rows(xs: &Tensor) -> Tensor {
    match xs.dim() {
        0 => xs.reshape([1, 1]),
        1 => xs.unsqueeze(1),
        _ => xs.flatten(1, -1),
    }
}

/// One-hot encode `labels` as `Float` with `num_classes` columns.
pub fn one_hot(labels: &Tensor, num_classes: i64) -> Tensor {
    labels.one_hot(num_classes).to_kind(Kind::Float)
}
