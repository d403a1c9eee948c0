// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation patching: add a fixed delta to one layer's input.
//!
//! A [`PatchingSession`] installs a pre-call hook on every decoder layer.
//! Only the hook at the target layer has an effect: it replaces the first
//! input element with `input0 + delta` (or `input0 + delta * mask`),
//! keeping any further input elements as they were.
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use candle_intervene::{HookedBlock, HookedModule, HookedStack, PatchingSession};
//!
//! let block = || HookedBlock::new(
//!     HookedModule::from_module(|x: &Tensor| x.zeros_like()),
//!     HookedModule::from_module(|x: &Tensor| x.zeros_like()),
//! );
//! let stack = HookedStack::new(vec![block(), block(), block()]);
//! let delta = Tensor::new(&[1.0_f32, 1.0], &Device::Cpu).unwrap();
//!
//! let mut session = PatchingSession::new(&stack, delta).layer(1);
//! let x = Tensor::zeros((1, 1, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
//! let out = session.scope(|| stack.forward(&x)).unwrap();
//! assert_eq!(out.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
//! assert_eq!(stack.num_active_hooks(), 0);
//! ```

use std::sync::Arc;

use candle_core::Tensor;
use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_PATCH_LAYER, PatchConfig};
use crate::error::{InterveneError, Result};
use crate::hooks::{HookHandleSet, HookPayload, HookPoint, HookableModule, PreHookFn};
use crate::model::{self, LayerStack};
use crate::ops;

/// Scoped additive intervention on one layer's input.
///
/// Inactive until [`enter`](Self::enter); [`exit`](Self::exit) (or
/// [`scope`](Self::scope), or dropping the session) releases every hook it
/// installed.
pub struct PatchingSession<'m> {
    /// Model the hooks are installed on.
    model: &'m dyn LayerStack,
    /// Delta added to the target layer's input, broadcastable against it.
    delta: Tensor,
    /// Target layer index.
    layer: usize,
    /// Optional per-position multiplier for `delta`.
    position_mask: Option<Tensor>,
    /// Hooks installed by the current activation.
    handles: HookHandleSet,
    /// Whether the session is between `enter` and `exit`.
    active: bool,
}

impl<'m> PatchingSession<'m> {
    /// Create an inactive session patching layer [`DEFAULT_PATCH_LAYER`].
    ///
    /// `delta` is shared with the caller, not copied.
    pub fn new(model: &'m dyn LayerStack, delta: Tensor) -> Self {
        Self {
            model,
            delta,
            layer: DEFAULT_PATCH_LAYER,
            position_mask: None,
            handles: HookHandleSet::new(),
            active: false,
        }
    }

    /// Create an inactive session from a parsed [`PatchConfig`].
    pub fn from_config(model: &'m dyn LayerStack, delta: Tensor, config: &PatchConfig) -> Self {
        Self::new(model, delta).layer(config.layer)
    }

    /// Set the target layer.
    #[must_use]
    pub fn layer(mut self, layer: usize) -> Self {
        self.layer = layer;
        self
    }

    /// Scale the delta per position by `mask` (e.g. shape `[1, seq, 1]`).
    #[must_use]
    pub fn position_mask(mut self, mask: Tensor) -> Self {
        self.position_mask = Some(mask);
        self
    }

    /// The target layer index.
    #[must_use]
    pub const fn target_layer(&self) -> usize {
        self.layer
    }

    /// Whether the session is active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Number of hooks currently installed by this session.
    #[must_use]
    pub fn num_handles(&self) -> usize {
        self.handles.len()
    }

    /// Interception points currently hooked, in installation order.
    pub fn hook_points(&self) -> impl Iterator<Item = &HookPoint> {
        self.handles.points()
    }

    /// Install a pre-call hook on every layer.
    ///
    /// A target outside the model's layer range installs the hooks anyway;
    /// none of them modifies anything.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Session`] if the session is already active,
    /// [`InterveneError::StructuralMismatch`] if the model does not expose
    /// its layers, and [`InterveneError::Model`] if `delta * mask` cannot be
    /// formed. On error no hook stays installed.
    pub fn enter(&mut self) -> Result<()> {
        if self.active {
            return Err(InterveneError::Session(
                "patching session is already active".into(),
            ));
        }

        let layers = model::layers(self.model)?;
        if self.layer >= layers.len() {
            warn!(
                layer = self.layer,
                num_layers = layers.len(),
                "patch target is outside the model, no layer will be patched"
            );
        }

        let delta = match &self.position_mask {
            Some(mask) => {
                let mask = ops::match_tensor(mask, &self.delta)?;
                self.delta.broadcast_mul(&mask)?
            }
            // BORROW: cheap clone, candle tensors share storage
            None => self.delta.clone(),
        };

        // Dropped (and thereby released) if any registration fails.
        let mut installed = HookHandleSet::with_capacity(layers.len());
        for (index, layer) in layers.into_iter().enumerate() {
            let hook = patch_hook(index, self.layer, delta.clone());
            installed.push(layer.register_pre_hook(HookPoint::ResidPre(index), hook)?);
        }

        self.handles = installed;
        self.active = true;
        debug!(
            layer = self.layer,
            handles = self.handles.len(),
            "patching session entered"
        );
        Ok(())
    }

    /// Release every installed hook. A no-op when inactive.
    pub fn exit(&mut self) {
        let released = self.handles.release_all();
        if self.active {
            debug!(layer = self.layer, released, "patching session exited");
        }
        self.active = false;
    }

    /// Run `f` with the session active, releasing the hooks afterwards
    /// whether `f` succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns the error from [`enter`](Self::enter), or the error from `f`.
    pub fn scope<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.enter()?;
        let result = f();
        self.exit();
        result
    }
}

impl Drop for PatchingSession<'_> {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Build the pre-call hook for layer `index`; it patches only when
/// `index == target`.
fn patch_hook(index: usize, target: usize, delta: Tensor) -> PreHookFn {
    Arc::new(move |input: &HookPayload| {
        if index != target {
            return Ok(None);
        }
        trace!(layer = index, "patching layer input");
        input
            .map_first(|hidden| ops::add_delta(hidden, &delta))
            .map(Some)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
