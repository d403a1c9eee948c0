// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unit directions in hidden-state space.

use std::path::Path;

use candle_core::{Device, Tensor};

use crate::error::{InterveneError, Result};
use crate::ops;

/// A last-axis normalized direction, immutable once constructed.
///
/// Built from a raw vector via [`normalize`](crate::ops::normalize); a zero
/// vector is accepted and yields a zero direction (ablating it is a no-op).
///
/// # Example
///
/// ```
/// use candle_intervene::Direction;
/// use candle_core::{Device, Tensor};
///
/// let raw = Tensor::new(&[3.0_f32, 4.0], &Device::Cpu).unwrap();
/// let dir = Direction::new(&raw).unwrap();
/// let unit: Vec<f32> = dir.as_tensor().to_vec1().unwrap();
/// assert!((unit[0] - 0.6).abs() < 1e-6);
/// ```
#[derive(Debug, Clone)]
pub struct Direction {
    /// Normalized vector, shape `[hidden_size]`.
    unit: Tensor,
}

impl Direction {
    /// Normalize `raw` into a direction.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Model`] if normalization fails.
    pub fn new(raw: &Tensor) -> Result<Self> {
        Ok(Self {
            unit: ops::normalize(raw)?,
        })
    }

    /// Load the tensor `name` from a `.safetensors` file and normalize it.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Io`] if the file cannot be read,
    /// [`InterveneError::Model`] if it is not valid safetensors, and
    /// [`InterveneError::Config`] if `name` is not present.
    pub fn from_safetensors(path: impl AsRef<Path>, name: &str, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mut tensors = candle_core::safetensors::load_buffer(&data, device)?;
        let raw = tensors.remove(name).ok_or_else(|| {
            let file = path.display();
            InterveneError::Config(format!("tensor `{name}` not found in {file}"))
        })?;
        Self::new(&raw)
    }

    /// The normalized vector.
    #[must_use]
    pub const fn as_tensor(&self) -> &Tensor {
        &self.unit
    }

    /// Size of the last axis.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Model`] if the direction is a scalar.
    pub fn hidden_size(&self) -> Result<usize> {
        Ok(self.unit.dim(candle_core::D::Minus1)?)
    }

    /// Projection of `hidden` onto this direction, shape `[..., 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Model`] on shape mismatch.
    pub fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        ops::project(hidden, &self.unit)
    }

    /// Remove `rate` times this direction's component from `hidden`.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Model`] on shape mismatch.
    pub fn ablate(&self, hidden: &Tensor, rate: f64) -> Result<Tensor> {
        ops::ablate(hidden, &self.unit, rate)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn safetensors_direction_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refusal.safetensors");
        let raw = Tensor::new(&[0.0_f32, 2.0, 0.0], &Device::Cpu).unwrap();
        let tensors = HashMap::from([("layer_12".to_string(), raw)]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let direction = Direction::from_safetensors(&path, "layer_12", &Device::Cpu).unwrap();
        assert_eq!(direction.hidden_size().unwrap(), 3);
        let unit: Vec<f32> = direction.as_tensor().to_vec1().unwrap();
        assert!((unit[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn missing_tensor_name_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dirs.safetensors");
        let raw = Tensor::new(&[1.0_f32, 0.0], &Device::Cpu).unwrap();
        candle_core::safetensors::save(&HashMap::from([("a".to_string(), raw)]), &path).unwrap();

        let err = Direction::from_safetensors(&path, "b", &Device::Cpu).unwrap_err();
        assert!(matches!(err, InterveneError::Config(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Direction::from_safetensors("/nonexistent/dir.safetensors", "a", &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, InterveneError::Io(_)));
    }

    #[test]
    fn corrupt_file_is_model_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");
        std::fs::write(&path, b"not a safetensors file").unwrap();

        let err = Direction::from_safetensors(&path, "a", &Device::Cpu).unwrap_err();
        assert!(matches!(err, InterveneError::Model(_)));
    }

    #[test]
    fn project_and_ablate_agree() {
        let raw = Tensor::new(&[1.0_f32, 1.0], &Device::Cpu).unwrap();
        let direction = Direction::new(&raw).unwrap();
        let hidden = Tensor::new(&[[2.0_f32, 0.0]], &Device::Cpu).unwrap();
        let weight: Vec<Vec<f32>> = direction.project(&hidden).unwrap().to_vec2().unwrap();
        assert!((weight[0][0] - std::f32::consts::SQRT_2).abs() < 1e-5);
        let ablated: Vec<Vec<f32>> = direction.ablate(&hidden, 1.0).unwrap().to_vec2().unwrap();
        assert!((ablated[0][0] - 1.0).abs() < 1e-5);
        assert!((ablated[0][1] + 1.0).abs() < 1e-5);
    }
}
