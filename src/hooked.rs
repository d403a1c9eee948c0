// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference host: candle modules with interception points.
//!
//! - [`HookRegistry`]: ordered pre/post hook table a host embeds in a
//!   component to implement [`HookableModule`].
//! - [`HookedModule`]: wraps a candle [`Module`] (or a payload-level
//!   closure) and runs its hooks around the forward call.
//! - [`HookedBlock`]: residual decoder block
//!   `h = x + attn(x); out = h + ffn(h)` with a layer pre-hook point.
//! - [`HookedStack`]: ordered blocks implementing [`LayerStack`].

use std::fmt;
use std::sync::Arc;

use candle_core::{Module, Tensor};
use parking_lot::Mutex;

use crate::error::Result;
use crate::hooks::{HookHandle, HookPayload, HookPoint, HookableModule, PostHookFn, PreHookFn};
use crate::model::{DecoderLayer, LayerStack};

// ---------------------------------------------------------------------------
// HookRegistry
// ---------------------------------------------------------------------------

/// Hook table behind a [`HookRegistry`].
#[derive(Default)]
struct HookTable {
    /// Next registration id.
    next_id: u64,
    /// Pre-call hooks in registration order.
    pre: Vec<(u64, PreHookFn)>,
    /// Post-call hooks in registration order.
    post: Vec<(u64, PostHookFn)>,
}

impl HookTable {
    /// Allocate a fresh registration id.
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Ordered pre-call and post-call hook table for one component.
///
/// Handles returned by [`add_pre`](Self::add_pre) and
/// [`add_post`](Self::add_post) hold only a weak reference to the table, so
/// a handle outliving its component releases nothing and does not keep the
/// component's hooks alive. The lock is never held while a hook runs, so a
/// hook may itself register or release hooks (taking effect on the next
/// call).
#[derive(Clone, Default)]
pub struct HookRegistry {
    /// Shared hook table.
    table: Arc<Mutex<HookTable>>,
}

impl HookRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pre-call hook.
    pub fn add_pre(&self, point: HookPoint, hook: PreHookFn) -> HookHandle {
        let id = {
            let mut table = self.table.lock();
            let id = table.next_id();
            table.pre.push((id, hook));
            id
        };
        let table = Arc::downgrade(&self.table);
        HookHandle::new(point, move || {
            if let Some(table) = table.upgrade() {
                table.lock().pre.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Append a post-call hook.
    pub fn add_post(&self, point: HookPoint, hook: PostHookFn) -> HookHandle {
        let id = {
            let mut table = self.table.lock();
            let id = table.next_id();
            table.post.push((id, hook));
            id
        };
        let table = Arc::downgrade(&self.table);
        HookHandle::new(point, move || {
            if let Some(table) = table.upgrade() {
                table.lock().post.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Number of registered hooks (pre and post).
    #[must_use]
    pub fn num_hooks(&self) -> usize {
        let table = self.table.lock();
        table.pre.len() + table.post.len()
    }

    /// Run pre-call hooks over `input` in registration order.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by a hook.
    pub fn run_pre(&self, mut input: HookPayload) -> Result<HookPayload> {
        // BORROW: snapshot the hook list so no lock is held while hooks run
        let hooks: Vec<PreHookFn> = {
            let table = self.table.lock();
            if table.pre.is_empty() {
                return Ok(input);
            }
            table.pre.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for hook in hooks {
            if let Some(replacement) = hook(&input)? {
                input = replacement;
            }
        }
        Ok(input)
    }

    /// Run post-call hooks over `output` in registration order.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by a hook.
    pub fn run_post(&self, input: &HookPayload, mut output: HookPayload) -> Result<HookPayload> {
        // BORROW: snapshot the hook list so no lock is held while hooks run
        let hooks: Vec<PostHookFn> = {
            let table = self.table.lock();
            if table.post.is_empty() {
                return Ok(output);
            }
            table.post.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for hook in hooks {
            if let Some(replacement) = hook(input, &output)? {
                output = replacement;
            }
        }
        Ok(output)
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("HookRegistry")
            .field("pre", &table.pre.len())
            .field("post", &table.post.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HookedModule
// ---------------------------------------------------------------------------

/// Payload-level forward function of a [`HookedModule`].
// TRAIT_OBJECT: attention and MLP implementations vary per host
type ForwardFn = Box<dyn Fn(&HookPayload) -> Result<HookPayload> + Send + Sync>;

/// A component whose forward call is wrapped by pre- and post-call hooks.
pub struct HookedModule {
    /// Hooks around the forward call.
    hooks: HookRegistry,
    /// The wrapped computation.
    forward: ForwardFn,
}

impl HookedModule {
    /// Wrap a payload-level forward function (may return tuples).
    pub fn new<F>(forward: F) -> Self
    where
        F: Fn(&HookPayload) -> Result<HookPayload> + Send + Sync + 'static,
    {
        Self {
            hooks: HookRegistry::new(),
            forward: Box::new(forward),
        }
    }

    /// Wrap a candle [`Module`]; it runs on the primary input element and
    /// produces a single-tensor output.
    pub fn from_module<M>(module: M) -> Self
    where
        M: Module + Send + Sync + 'static,
    {
        Self::new(move |input| Ok(HookPayload::Single(module.forward(input.primary()?)?)))
    }

    /// The hook table of this component.
    #[must_use]
    pub const fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Run pre-call hooks, the wrapped computation, then post-call hooks.
    ///
    /// # Errors
    ///
    /// Propagates errors from hooks and from the wrapped computation.
    pub fn forward(&self, input: HookPayload) -> Result<HookPayload> {
        let input = self.hooks.run_pre(input)?;
        let output = (self.forward)(&input)?;
        self.hooks.run_post(&input, output)
    }
}

impl HookableModule for HookedModule {
    fn register_pre_hook(&self, point: HookPoint, hook: PreHookFn) -> Result<HookHandle> {
        Ok(self.hooks.add_pre(point, hook))
    }

    fn register_post_hook(&self, point: HookPoint, hook: PostHookFn) -> Result<HookHandle> {
        Ok(self.hooks.add_post(point, hook))
    }
}

impl fmt::Debug for HookedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedModule")
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// HookedBlock
// ---------------------------------------------------------------------------

/// Residual decoder block with interception points.
///
/// The layer input passes through the block's pre-call hooks, then the
/// attention sub-component receives the whole (possibly tuple) input
/// payload, and the feed-forward sub-component receives the post-attention
/// residual stream.
#[derive(Debug)]
pub struct HookedBlock {
    /// Layer-level hooks (pre-call only).
    hooks: HookRegistry,
    /// Self-attention sub-component.
    attention: HookedModule,
    /// Feed-forward sub-component.
    feed_forward: HookedModule,
}

impl HookedBlock {
    /// Assemble a block from its two sub-components.
    #[must_use]
    pub fn new(attention: HookedModule, feed_forward: HookedModule) -> Self {
        Self {
            hooks: HookRegistry::new(),
            attention,
            feed_forward,
        }
    }

    /// Total hooks registered on the block and its sub-components.
    #[must_use]
    pub fn num_hooks(&self) -> usize {
        self.hooks.num_hooks()
            + self.attention.hooks().num_hooks()
            + self.feed_forward.hooks().num_hooks()
    }

    /// Run the block.
    ///
    /// # Shapes
    /// - `input`: primary element `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from hooks and sub-components.
    pub fn forward(&self, input: HookPayload) -> Result<Tensor> {
        let input = self.hooks.run_pre(input)?;
        // BORROW: cheap clone, candle tensors share storage
        let residual = input.primary()?.clone();

        let attn_out = self.attention.forward(input)?.into_primary()?;
        let hidden = (residual + attn_out)?;

        let mlp_out = self
            .feed_forward
            .forward(HookPayload::Single(hidden.clone()))?
            .into_primary()?;
        Ok((hidden + mlp_out)?)
    }
}

impl HookableModule for HookedBlock {
    fn register_pre_hook(&self, point: HookPoint, hook: PreHookFn) -> Result<HookHandle> {
        Ok(self.hooks.add_pre(point, hook))
    }
}

impl DecoderLayer for HookedBlock {
    fn attention(&self) -> Option<&dyn HookableModule> {
        Some(&self.attention)
    }

    fn feed_forward(&self) -> Option<&dyn HookableModule> {
        Some(&self.feed_forward)
    }
}

// ---------------------------------------------------------------------------
// HookedStack
// ---------------------------------------------------------------------------

/// Ordered sequence of [`HookedBlock`]s.
#[derive(Debug, Default)]
pub struct HookedStack {
    /// Decoder blocks in model order.
    blocks: Vec<HookedBlock>,
}

impl HookedStack {
    /// Create a stack from blocks in model order.
    #[must_use]
    pub const fn new(blocks: Vec<HookedBlock>) -> Self {
        Self { blocks }
    }

    /// The blocks, in model order.
    #[must_use]
    pub fn blocks(&self) -> &[HookedBlock] {
        &self.blocks
    }

    /// Total hooks currently registered anywhere in the stack.
    #[must_use]
    pub fn num_active_hooks(&self) -> usize {
        self.blocks.iter().map(HookedBlock::num_hooks).sum()
    }

    /// Run every block on a single-tensor hidden state.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from hooks and sub-components.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.forward_with_extras(hidden, &[])
    }

    /// Run every block with `extras` appended to each layer's input tuple.
    ///
    /// With non-empty `extras`, each layer receives
    /// `HookPayload::Tuple([hidden, extras...])`.
    ///
    /// # Errors
    ///
    /// Propagates errors from hooks and sub-components.
    pub fn forward_with_extras(&self, hidden: &Tensor, extras: &[Tensor]) -> Result<Tensor> {
        // BORROW: cheap clone, candle tensors share storage
        let mut hidden = hidden.clone();
        for block in &self.blocks {
            let input = if extras.is_empty() {
                HookPayload::Single(hidden)
            } else {
                let mut items = Vec::with_capacity(extras.len() + 1);
                items.push(hidden);
                items.extend(extras.iter().cloned());
                HookPayload::Tuple(items)
            };
            hidden = block.forward(input)?;
        }
        Ok(hidden)
    }
}

impl LayerStack for HookedStack {
    fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    fn layer(&self, index: usize) -> Option<&dyn DecoderLayer> {
        self.blocks.get(index).map(|b| b as &dyn DecoderLayer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn vec1(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn doubling() -> HookedModule {
        HookedModule::from_module(|x: &Tensor| x * 2.0)
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let module = doubling();
        let _add = module.hooks().add_pre(
            HookPoint::Custom("add".into()),
            Arc::new(|input: &HookPayload| input.map_first(|t| Ok((t + 1.0)?)).map(Some)),
        );
        let _mul = module.hooks().add_pre(
            HookPoint::Custom("mul".into()),
            Arc::new(|input: &HookPayload| input.map_first(|t| Ok((t * 10.0)?)).map(Some)),
        );

        let x = Tensor::new(&[1.0_f32], &Device::Cpu).unwrap();
        let out = module.forward(x.into()).unwrap().into_primary().unwrap();
        // ((1 + 1) * 10) * 2
        assert_eq!(vec1(&out), vec![40.0]);
    }

    #[test]
    fn released_hook_stops_firing() {
        let module = doubling();
        let mut handle = module.hooks().add_post(
            HookPoint::Custom("zero".into()),
            Arc::new(|_: &HookPayload, output: &HookPayload| {
                output.map_first(|t| Ok(t.zeros_like()?)).map(Some)
            }),
        );
        assert_eq!(module.hooks().num_hooks(), 1);

        let x = Tensor::new(&[3.0_f32], &Device::Cpu).unwrap();
        let hooked = module.forward(x.clone().into()).unwrap().into_primary().unwrap();
        assert_eq!(vec1(&hooked), vec![0.0]);

        handle.release();
        assert_eq!(module.hooks().num_hooks(), 0);
        let plain = module.forward(x.into()).unwrap().into_primary().unwrap();
        assert_eq!(vec1(&plain), vec![6.0]);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let module = doubling();
        let mut handle = module
            .hooks()
            .add_pre(HookPoint::ResidPre(0), Arc::new(|_: &HookPayload| Ok(None)));
        drop(module);
        handle.release();
        assert!(handle.is_released());
    }

    #[test]
    fn block_is_residual() {
        let block = HookedBlock::new(doubling(), doubling());
        let x = Tensor::new(&[[[1.0_f32, -1.0]]], &Device::Cpu).unwrap();
        // h = x + 2x = 3x; out = h + 2h = 9x
        let out = block.forward(x.into()).unwrap();
        assert_eq!(vec1(&out), vec![9.0, -9.0]);
    }

    #[test]
    fn stack_implements_layer_stack() {
        let stack = HookedStack::new(vec![
            HookedBlock::new(doubling(), doubling()),
            HookedBlock::new(doubling(), doubling()),
        ]);
        assert_eq!(stack.num_layers(), 2);
        assert!(stack.layer(1).is_some());
        assert!(stack.layer(2).is_none());
        assert_eq!(stack.num_active_hooks(), 0);

        let x = Tensor::new(&[[[1.0_f32]]], &Device::Cpu).unwrap();
        let out = stack.forward(&x).unwrap();
        assert_eq!(vec1(&out), vec![81.0]);
    }
}
