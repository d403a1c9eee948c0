// SPDX-License-Identifier: MIT OR Apache-2.0

//! Intervention configuration and experiment-file parsing.
//!
//! [`PatchConfig`] and [`AblationConfig`] hold the scalar parameters of the
//! two session types; [`InterventionConfig`] is the tagged form used in
//! experiment files, dispatching on a `kind` field.
//!
//! # Usage
//!
//! ```
//! use candle_intervene::{InterventionConfig, PatchConfig};
//!
//! let json = serde_json::json!({"kind": "patch", "layer": 12});
//! let config = InterventionConfig::from_json(&json).unwrap();
//! assert_eq!(config, InterventionConfig::Patch(PatchConfig { layer: 12 }));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{InterveneError, Result};

/// Layer patched when none is configured.
pub const DEFAULT_PATCH_LAYER: usize = 15;

/// Ablation rate used when none is configured (full orthogonal removal).
pub const DEFAULT_ABLATION_RATE: f64 = 1.0;

// ---------------------------------------------------------------------------
// PatchConfig
// ---------------------------------------------------------------------------

/// Parameters of a [`PatchingSession`](crate::PatchingSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Index of the layer whose input receives the delta.
    #[serde(default = "default_patch_layer")]
    pub layer: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            layer: DEFAULT_PATCH_LAYER,
        }
    }
}

impl PatchConfig {
    /// Parse from a JSON object. `layer` is optional.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Config`] if `layer` is present but not a
    /// non-negative integer.
    pub fn from_json(config: &Value) -> Result<Self> {
        Ok(Self {
            layer: get_optional_usize(config, "layer")?.unwrap_or(DEFAULT_PATCH_LAYER),
        })
    }
}

/// Serde default for [`PatchConfig::layer`].
const fn default_patch_layer() -> usize {
    DEFAULT_PATCH_LAYER
}

// ---------------------------------------------------------------------------
// AblationConfig
// ---------------------------------------------------------------------------

/// Parameters of an [`AblationSession`](crate::AblationSession).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AblationConfig {
    /// Fraction of the direction's component to remove.
    #[serde(default = "default_ablation_rate")]
    pub rate: f64,
}

impl Default for AblationConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_ABLATION_RATE,
        }
    }
}

impl AblationConfig {
    /// Parse from a JSON object. `rate` is optional; values outside `[0, 1]`
    /// are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Config`] if `rate` is present but not a
    /// finite number.
    pub fn from_json(config: &Value) -> Result<Self> {
        Ok(Self {
            rate: get_optional_f64(config, "rate")?.unwrap_or(DEFAULT_ABLATION_RATE),
        })
    }
}

/// Serde default for [`AblationConfig::rate`].
const fn default_ablation_rate() -> f64 {
    DEFAULT_ABLATION_RATE
}

// ---------------------------------------------------------------------------
// InterventionConfig
// ---------------------------------------------------------------------------

/// One intervention as written in an experiment file.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InterventionConfig {
    /// Add a delta to one layer's input.
    Patch(PatchConfig),
    /// Remove a direction at every layer.
    Ablation(AblationConfig),
}

impl InterventionConfig {
    /// Parse from a JSON object, dispatching on its `kind` field.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Config`] if `kind` is missing or unknown,
    /// or if a parameter has the wrong type.
    pub fn from_json(config: &Value) -> Result<Self> {
        let kind = config
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| InterveneError::Config("missing 'kind' field".into()))?;

        match kind {
            "patch" => Ok(Self::Patch(PatchConfig::from_json(config)?)),
            "ablation" => Ok(Self::Ablation(AblationConfig::from_json(config)?)),
            other => Err(InterveneError::Config(format!(
                "unsupported intervention kind: '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract an optional `usize` field; present-but-invalid is an error.
fn get_optional_usize(config: &Value, key: &str) -> Result<Option<usize>> {
    let Some(val) = config.get(key) else {
        return Ok(None);
    };
    let val = val.as_u64().ok_or_else(|| {
        InterveneError::Config(format!("field '{key}' must be a non-negative integer"))
    })?;
    usize::try_from(val)
        .map(Some)
        .map_err(|_| InterveneError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional finite `f64` field; present-but-invalid is an error.
fn get_optional_f64(config: &Value, key: &str) -> Result<Option<f64>> {
    let Some(val) = config.get(key) else {
        return Ok(None);
    };
    match val.as_f64() {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(InterveneError::Config(format!(
            "field '{key}' must be a finite number"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
