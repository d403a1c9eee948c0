// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vector operations shared by the intervention sessions.
//!
//! - [`normalize`]: epsilon-guarded last-axis normalization.
//! - [`project`]: keep-dim dot product of hidden states with a direction.
//! - [`ablate`] / [`ablate_masked`]: remove (a fraction of) a direction's
//!   projection, `h' = h - rate * (h . d) * d`.
//!
//! Directions are cast to the hidden state's dtype and device before use,
//! so an `F32` direction can be applied to `BF16` activations on CUDA.
//! Reductions over the hidden axis of `BF16`/`F16` activations run in `F32`;
//! results come back in the activation dtype.

use candle_core::{D, DType, Tensor};

use crate::error::Result;

/// Epsilon added to the norm in [`normalize`] to avoid division by zero.
pub const NORM_EPS: f64 = 1e-12;

/// Normalize `direction` along its last axis.
///
/// Computes `direction / (||direction|| + NORM_EPS)`. A zero vector does not
/// fail: it normalizes to a zero vector (not a unit one).
///
/// # Shapes
/// - `direction`: `[..., hidden_size]`
/// - returns: same shape as `direction`
///
/// # Errors
///
/// Returns [`InterveneError::Model`](crate::InterveneError::Model) if the
/// underlying tensor operation fails.
pub fn normalize(direction: &Tensor) -> Result<Tensor> {
    let norm = direction.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let denom = (norm + NORM_EPS)?;
    Ok(direction.broadcast_div(&denom)?)
}

/// Dot product of `hidden` with `unit_direction` along the last axis.
///
/// # Shapes
/// - `hidden`: `[..., hidden_size]`
/// - `unit_direction`: `[hidden_size]` (or broadcastable against `hidden`)
/// - returns: `[..., 1]`
///
/// # Errors
///
/// Returns [`InterveneError::Model`](crate::InterveneError::Model) on shape
/// mismatch.
pub fn project(hidden: &Tensor, unit_direction: &Tensor) -> Result<Tensor> {
    let dtype = hidden.dtype();
    // PROMOTE: half-precision dot products need f32 accumulation
    let h = hidden.to_dtype(accumulation_dtype(dtype))?;
    let direction = match_tensor(unit_direction, &h)?;
    let weight = h.broadcast_mul(&direction)?.sum_keepdim(D::Minus1)?;
    Ok(weight.to_dtype(dtype)?)
}

/// Remove `rate` times the projection of `hidden` onto `unit_direction`.
///
/// `rate = 1.0` is a full orthogonal projection, `rate = 0.0` returns
/// `hidden` unchanged. Rates outside `[0, 1]` are not rejected: they
/// extrapolate (over-ablation, or amplification for negative rates).
///
/// # Shapes
/// - `hidden`: `[..., hidden_size]`
/// - `unit_direction`: `[hidden_size]`
/// - returns: same shape as `hidden`
///
/// # Errors
///
/// Returns [`InterveneError::Model`](crate::InterveneError::Model) on shape
/// mismatch.
pub fn ablate(hidden: &Tensor, unit_direction: &Tensor, rate: f64) -> Result<Tensor> {
    ablate_masked(hidden, unit_direction, rate, None)
}

/// [`ablate`] with an optional per-position mask scaling the removed part.
///
/// With a mask, position `p` becomes `h_p - mask_p * rate * (h_p . d) * d`.
///
/// # Shapes
/// - `hidden`: `[batch, seq, hidden_size]`
/// - `unit_direction`: `[hidden_size]`
/// - `mask`: broadcastable against `[batch, seq, 1]`, e.g. `[1, seq, 1]`
/// - returns: same shape as `hidden`
///
/// # Errors
///
/// Returns [`InterveneError::Model`](crate::InterveneError::Model) on shape
/// mismatch.
pub fn ablate_masked(
    hidden: &Tensor,
    unit_direction: &Tensor,
    rate: f64,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let dtype = hidden.dtype();
    // PROMOTE: half-precision dot products need f32 accumulation
    let compute = accumulation_dtype(dtype);
    let h = hidden.to_dtype(compute)?;
    let direction = match_tensor(unit_direction, &h)?;
    let weight = h.broadcast_mul(&direction)?.sum_keepdim(D::Minus1)?;
    let mut removed = (weight.broadcast_mul(&direction)? * rate)?;
    if let Some(mask) = mask {
        removed = removed.broadcast_mul(&match_tensor(mask, &h)?)?;
    }
    Ok(h.broadcast_sub(&removed)?.to_dtype(dtype)?)
}

/// Add `delta` to `hidden`, broadcasting and matching dtype/device.
///
/// # Errors
///
/// Returns [`InterveneError::Model`](crate::InterveneError::Model) if the
/// shapes do not broadcast.
pub(crate) fn add_delta(hidden: &Tensor, delta: &Tensor) -> Result<Tensor> {
    Ok(hidden.broadcast_add(&match_tensor(delta, hidden)?)?)
}

/// Dtype used for reductions over the hidden axis: `F32` for half types.
const fn accumulation_dtype(dtype: DType) -> DType {
    match dtype {
        DType::BF16 | DType::F16 => DType::F32,
        other => other,
    }
}

/// Cast `tensor` to the dtype and device of `like` (no-op when they match).
pub(crate) fn match_tensor(tensor: &Tensor, like: &Tensor) -> Result<Tensor> {
    // BORROW: cheap clone, candle tensors share storage
    let tensor = tensor.to_device(like.device())?;
    Ok(tensor.to_dtype(like.dtype())?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
