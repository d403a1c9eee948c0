// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model-side capability traits and layer traversal.
//!
//! [`LayerStack`] and [`DecoderLayer`] are the narrow interface this crate
//! needs from a model: an ordered list of decoder layers, each accepting
//! pre-call hooks and owning an attention and a feed-forward sub-component
//! that accept post-call hooks. [`layers`], [`attention_sublayers`] and
//! [`feedforward_sublayers`] walk that structure in layer order.

use crate::error::{InterveneError, Result};
use crate::hooks::HookableModule;

/// One decoder block.
pub trait DecoderLayer: HookableModule {
    /// The self-attention sub-component, if the layer exposes one.
    fn attention(&self) -> Option<&dyn HookableModule>;

    /// The feed-forward (MLP) sub-component, if the layer exposes one.
    fn feed_forward(&self) -> Option<&dyn HookableModule>;
}

/// A fixed, ordered sequence of decoder layers.
pub trait LayerStack {
    /// Number of decoder layers.
    fn num_layers(&self) -> usize;

    /// Layer at `index` (0-based), or `None` if the model cannot provide it.
    fn layer(&self, index: usize) -> Option<&dyn DecoderLayer>;
}

/// All decoder layers, in model order.
///
/// # Errors
///
/// Returns [`InterveneError::StructuralMismatch`] if any index below
/// [`num_layers`](LayerStack::num_layers) has no layer.
pub fn layers(model: &dyn LayerStack) -> Result<Vec<&dyn DecoderLayer>> {
    let n = model.num_layers();
    (0..n)
        .map(|i| {
            model.layer(i).ok_or_else(|| {
                InterveneError::StructuralMismatch(format!("layer {i} of {n} is missing"))
            })
        })
        .collect()
}

/// The attention sub-component of every layer, in model order.
///
/// # Errors
///
/// Returns [`InterveneError::StructuralMismatch`] if a layer is missing or
/// has no attention sub-component.
pub fn attention_sublayers(model: &dyn LayerStack) -> Result<Vec<&dyn HookableModule>> {
    sublayers(model, "attention", |layer| layer.attention())
}

/// The feed-forward sub-component of every layer, in model order.
///
/// # Errors
///
/// Returns [`InterveneError::StructuralMismatch`] if a layer is missing or
/// has no feed-forward sub-component.
pub fn feedforward_sublayers(model: &dyn LayerStack) -> Result<Vec<&dyn HookableModule>> {
    sublayers(model, "feed-forward", |layer| layer.feed_forward())
}

/// Shared traversal for [`attention_sublayers`] and [`feedforward_sublayers`].
fn sublayers<'m, F>(
    model: &'m dyn LayerStack,
    kind: &str,
    get: F,
) -> Result<Vec<&'m dyn HookableModule>>
where
    F: Fn(&'m dyn DecoderLayer) -> Option<&'m dyn HookableModule>,
{
    layers(model)?
        .into_iter()
        .enumerate()
        .map(|(i, layer)| {
            get(layer).ok_or_else(|| {
                InterveneError::StructuralMismatch(format!("layer {i} has no {kind} sub-component"))
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// A layer that exposes only the sub-components it is told to.
    struct StubLayer {
        attention: Option<StubModule>,
        feed_forward: Option<StubModule>,
    }

    struct StubModule;
    impl HookableModule for StubModule {}
    impl HookableModule for StubLayer {}

    impl DecoderLayer for StubLayer {
        fn attention(&self) -> Option<&dyn HookableModule> {
            self.attention.as_ref().map(|m| m as &dyn HookableModule)
        }
        fn feed_forward(&self) -> Option<&dyn HookableModule> {
            self.feed_forward.as_ref().map(|m| m as &dyn HookableModule)
        }
    }

    struct StubStack {
        layers: Vec<StubLayer>,
        claimed: usize,
    }

    impl LayerStack for StubStack {
        fn num_layers(&self) -> usize {
            self.claimed
        }
        fn layer(&self, index: usize) -> Option<&dyn DecoderLayer> {
            self.layers.get(index).map(|l| l as &dyn DecoderLayer)
        }
    }

    fn full_layer() -> StubLayer {
        StubLayer {
            attention: Some(StubModule),
            feed_forward: Some(StubModule),
        }
    }

    #[test]
    fn traversal_counts_match_layers() {
        let stack = StubStack {
            layers: vec![full_layer(), full_layer(), full_layer()],
            claimed: 3,
        };
        assert_eq!(layers(&stack).unwrap().len(), 3);
        assert_eq!(attention_sublayers(&stack).unwrap().len(), 3);
        assert_eq!(feedforward_sublayers(&stack).unwrap().len(), 3);
    }

    #[test]
    fn missing_layer_is_structural_mismatch() {
        let stack = StubStack {
            layers: vec![full_layer()],
            claimed: 2,
        };
        assert!(matches!(
            layers(&stack),
            Err(InterveneError::StructuralMismatch(_))
        ));
    }

    #[test]
    fn missing_sublayer_is_structural_mismatch() {
        let stack = StubStack {
            layers: vec![
                full_layer(),
                StubLayer {
                    attention: Some(StubModule),
                    feed_forward: None,
                },
            ],
            claimed: 2,
        };
        assert_eq!(attention_sublayers(&stack).unwrap().len(), 2);
        let err = feedforward_sublayers(&stack).err().unwrap();
        assert!(err.to_string().contains("layer 1 has no feed-forward"));
    }
}
