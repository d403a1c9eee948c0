// SPDX-License-Identifier: MIT OR Apache-2.0

//! Directional ablation: remove a direction from activations at every layer.
//!
//! An [`AblationSession`] installs, for every decoder layer:
//!
//! - a pre-call hook on the layer, ablating its input;
//! - a post-call hook on the attention sub-component, ablating its output;
//! - a post-call hook on the feed-forward sub-component, ablating its output.
//!
//! Each hook applies `h' = h - rate * mask * (h . d) * d` to the primary
//! element of the payload and keeps the rest of a tuple payload unchanged.
//! Without a position mask the mask factor is 1.

use std::sync::Arc;

use candle_core::Tensor;
use tracing::{debug, trace};

use crate::config::{AblationConfig, DEFAULT_ABLATION_RATE};
use crate::direction::Direction;
use crate::error::{InterveneError, Result};
use crate::hooks::{
    HookHandleSet, HookPayload, HookPoint, HookableModule, PostHookFn, PreHookFn,
};
use crate::model::{self, LayerStack};
use crate::ops;

/// Scoped removal of one direction from every layer's residual traffic.
///
/// Inactive until [`enter`](Self::enter); [`exit`](Self::exit) (or
/// [`scope`](Self::scope), or dropping the session) releases every hook it
/// installed.
pub struct AblationSession<'m> {
    /// Model the hooks are installed on.
    model: &'m dyn LayerStack,
    /// Normalized direction to remove.
    direction: Direction,
    /// Fraction of the component to remove.
    rate: f64,
    /// Optional per-position multiplier for the removed component.
    position_mask: Option<Tensor>,
    /// Hooks installed by the current activation.
    handles: HookHandleSet,
    /// Whether the session is between `enter` and `exit`.
    active: bool,
}

impl<'m> AblationSession<'m> {
    /// Create an inactive session removing `direction` (normalized here) at
    /// rate [`DEFAULT_ABLATION_RATE`].
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Model`] if the direction cannot be normalized.
    pub fn new(model: &'m dyn LayerStack, direction: &Tensor) -> Result<Self> {
        Ok(Self::with_direction(model, Direction::new(direction)?))
    }

    /// Create an inactive session from an already normalized [`Direction`].
    pub fn with_direction(model: &'m dyn LayerStack, direction: Direction) -> Self {
        Self {
            model,
            direction,
            rate: DEFAULT_ABLATION_RATE,
            position_mask: None,
            handles: HookHandleSet::new(),
            active: false,
        }
    }

    /// Create an inactive session from a parsed [`AblationConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Model`] if the direction cannot be normalized.
    pub fn from_config(
        model: &'m dyn LayerStack,
        direction: &Tensor,
        config: &AblationConfig,
    ) -> Result<Self> {
        Ok(Self::new(model, direction)?.rate(config.rate))
    }

    /// Set the ablation rate (`1.0` full removal, `0.0` no-op).
    #[must_use]
    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Scale the removed component per position by `mask` (e.g. `[1, seq, 1]`).
    #[must_use]
    pub fn position_mask(mut self, mask: Tensor) -> Self {
        self.position_mask = Some(mask);
        self
    }

    /// The normalized direction.
    #[must_use]
    pub const fn direction(&self) -> &Direction {
        &self.direction
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

    /// Install the three hooks of every layer (`3 * num_layers` in total).
    ///
    /// The model's structure is checked before anything is installed.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Session`] if the session is already active
    /// and [`InterveneError::StructuralMismatch`] if a layer or one of its
    /// sub-components is missing or refuses the hook. On error no hook stays
    /// installed.
    pub fn enter(&mut self) -> Result<()> {
        if self.active {
            return Err(InterveneError::Session(
                "ablation session is already active".into(),
            ));
        }

        let layers = model::layers(self.model)?;
        let attention = model::attention_sublayers(self.model)?;
        let feed_forward = model::feedforward_sublayers(self.model)?;

        let ablator = Ablator {
            // BORROW: cheap clones, candle tensors share storage
            direction: self.direction.as_tensor().clone(),
            rate: self.rate,
            mask: self.position_mask.clone(),
        };

        // Dropped (and thereby released) if any registration fails.
        let mut installed = HookHandleSet::with_capacity(3 * layers.len());
        let per_layer = layers.into_iter().zip(attention).zip(feed_forward);
        for (index, ((layer, attn), mlp)) in per_layer.enumerate() {
            let point = HookPoint::ResidPre(index);
            let hook = ablate_input(point.clone(), ablator.clone());
            installed.push(layer.register_pre_hook(point, hook)?);

            let point = HookPoint::AttnOut(index);
            let hook = ablate_output(point.clone(), ablator.clone());
            installed.push(attn.register_post_hook(point, hook)?);

            let point = HookPoint::MlpOut(index);
            let hook = ablate_output(point.clone(), ablator.clone());
            installed.push(mlp.register_post_hook(point, hook)?);
        }

        self.handles = installed;
        self.active = true;
        debug!(
            rate = self.rate,
            masked = self.position_mask.is_some(),
            handles = self.handles.len(),
            "ablation session entered"
        );
        Ok(())
    }

    /// Release every installed hook. A no-op when inactive.
    pub fn exit(&mut self) {
        let released = self.handles.release_all();
        if self.active {
            debug!(released, "ablation session exited");
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

impl Drop for AblationSession<'_> {
    fn drop(&mut self) {
        self.exit();
    }
}

// ---------------------------------------------------------------------------
// Hook factories
// ---------------------------------------------------------------------------

/// The transform shared by all hooks of one session.
#[derive(Clone)]
struct Ablator {
    /// Unit direction.
    direction: Tensor,
    /// Fraction to remove.
    rate: f64,
    /// Optional per-position multiplier.
    mask: Option<Tensor>,
}

impl Ablator {
    /// Ablate the primary element of `payload`, keeping its shape.
    fn apply(&self, payload: &HookPayload) -> Result<HookPayload> {
        payload.map_first(|hidden| {
            ops::ablate_masked(hidden, &self.direction, self.rate, self.mask.as_ref())
        })
    }
}

/// Pre-call hook ablating a layer's input.
fn ablate_input(point: HookPoint, ablator: Ablator) -> PreHookFn {
    Arc::new(move |input: &HookPayload| {
        trace!(%point, "ablating direction");
        ablator.apply(input).map(Some)
    })
}

/// Post-call hook ablating a sub-component's output.
fn ablate_output(point: HookPoint, ablator: Ablator) -> PostHookFn {
    Arc::new(move |_input: &HookPayload, output: &HookPayload| {
        trace!(%point, "ablating direction");
        ablator.apply(output).map(Some)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::hooked::{HookedBlock, HookedModule, HookedStack};

    fn identity_block() -> HookedBlock {
        HookedBlock::new(
            HookedModule::from_module(|x: &Tensor| x.copy()),
            HookedModule::from_module(|x: &Tensor| x.copy()),
        )
    }

    fn ablator(rate: f64) -> Ablator {
        Ablator {
            direction: Tensor::new(&[1.0_f32, 0.0], &Device::Cpu).unwrap(),
            rate,
            mask: None,
        }
    }

    #[test]
    fn input_hook_handles_single_and_tuple() {
        let hook = ablate_input(HookPoint::ResidPre(0), ablator(1.0));
        let h = Tensor::new(&[3.0_f32, 4.0], &Device::Cpu).unwrap();
        let extra = Tensor::new(&[7.0_f32], &Device::Cpu).unwrap();

        let single = hook(&HookPayload::Single(h.clone())).unwrap().unwrap();
        assert_eq!(single.primary().unwrap().to_vec1::<f32>().unwrap(), vec![0.0, 4.0]);

        let tuple = hook(&HookPayload::Tuple(vec![h, extra])).unwrap().unwrap();
        assert!(tuple.is_tuple());
        assert_eq!(tuple.primary().unwrap().to_vec1::<f32>().unwrap(), vec![0.0, 4.0]);
        assert_eq!(tuple.rest()[0].to_vec1::<f32>().unwrap(), vec![7.0]);
    }

    #[test]
    fn output_hook_ignores_input() {
        let hook = ablate_output(HookPoint::MlpOut(0), ablator(0.5));
        let input = HookPayload::Single(Tensor::new(&[100.0_f32, 100.0], &Device::Cpu).unwrap());
        let output = HookPayload::Single(Tensor::new(&[2.0_f32, 1.0], &Device::Cpu).unwrap());
        let out = hook(&input, &output).unwrap().unwrap().into_primary().unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn installs_three_hooks_per_layer() {
        let model = HookedStack::new(vec![identity_block(), identity_block()]);
        let dir = Tensor::new(&[0.0_f32, 1.0], &Device::Cpu).unwrap();
        let mut session = AblationSession::new(&model, &dir).unwrap();
        assert_eq!(model.num_active_hooks(), 0);

        session.enter().unwrap();
        assert!(session.is_active());
        assert_eq!(session.num_handles(), 6);
        assert_eq!(model.num_active_hooks(), 6);
        let points: Vec<String> = session.hook_points().map(ToString::to_string).collect();
        assert_eq!(
            points[..3],
            [
                "blocks.0.hook_resid_pre",
                "blocks.0.hook_attn_out",
                "blocks.0.hook_mlp_out"
            ]
        );

        session.exit();
        assert!(!session.is_active());
        assert_eq!(model.num_active_hooks(), 0);
    }

    #[test]
    fn enter_twice_is_rejected() {
        let model = HookedStack::new(vec![identity_block()]);
        let dir = Tensor::new(&[1.0_f32, 1.0], &Device::Cpu).unwrap();
        let mut session = AblationSession::new(&model, &dir).unwrap();
        session.enter().unwrap();
        assert!(matches!(session.enter(), Err(InterveneError::Session(_))));
        assert_eq!(model.num_active_hooks(), 3);
    }

    #[test]
    fn direction_is_normalized_at_construction() {
        let model = HookedStack::new(vec![identity_block()]);
        let dir = Tensor::new(&[0.0_f32, 10.0], &Device::Cpu).unwrap();
        let config = AblationConfig { rate: 0.5 };
        let session = AblationSession::from_config(&model, &dir, &config).unwrap();
        let unit: Vec<f32> = session.direction().as_tensor().to_vec1().unwrap();
        assert!((unit[1] - 1.0).abs() < 1e-6);
    }
}
