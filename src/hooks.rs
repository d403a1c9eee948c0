// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interception points, hook payloads, and revocable hook handles.
//!
//! Provides [`HookPoint`] (named interception points in a forward pass),
//! [`HookPayload`] (the value flowing through an interception point),
//! [`HookHandle`] (a revocable registration) and [`HookableModule`] (the
//! capability a model component exposes to accept hooks).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{InterveneError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named interception point in a decoder stack.
///
/// Uses the `TransformerLens` naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// ```
/// use candle_intervene::HookPoint;
///
/// let hook = HookPoint::AttnOut(5);
/// assert_eq!(hook.to_string(), "blocks.5.hook_attn_out");
///
/// let parsed: HookPoint = "blocks.5.hook_attn_out".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`], used to label hooks
/// registered on host-specific components.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Input of decoder layer `i`, before it computes (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Output of the attention sub-component of layer `i` (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Output of the feed-forward sub-component of layer `i` (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Host-specific interception point.
    Custom(String),
}

impl HookPoint {
    /// Layer index this point belongs to, if any.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i) | Self::AttnOut(i) | Self::MlpOut(i) => Some(*i),
            Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    if let Some((layer_str, suffix)) = s.strip_prefix("blocks.").and_then(|r| r.split_once('.')) {
        if let Ok(layer) = layer_str.parse::<usize>() {
            match suffix {
                "hook_resid_pre" => return HookPoint::ResidPre(layer),
                "hook_attn_out" => return HookPoint::AttnOut(layer),
                "hook_mlp_out" => return HookPoint::MlpOut(layer),
                _ => {}
            }
        }
    }
    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// HookPayload
// ---------------------------------------------------------------------------

/// Value observed at an interception point.
///
/// Components receive and produce either a single tensor or an ordered
/// tuple whose first element is the primary hidden state (the rest being
/// e.g. attention weights or position embeddings). Interventions only ever
/// touch the primary element; see [`map_first`](Self::map_first).
#[derive(Debug, Clone)]
pub enum HookPayload {
    /// A single hidden-state tensor.
    Single(Tensor),
    /// An ordered tuple; element 0 is the hidden state.
    Tuple(Vec<Tensor>),
}

impl HookPayload {
    /// The primary hidden-state tensor.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Hook`] for an empty tuple.
    pub fn primary(&self) -> Result<&Tensor> {
        match self {
            Self::Single(t) => Ok(t),
            Self::Tuple(items) => items.first().ok_or_else(empty_tuple),
        }
    }

    /// Consume the payload and return the primary tensor.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Hook`] for an empty tuple.
    pub fn into_primary(self) -> Result<Tensor> {
        match self {
            Self::Single(t) => Ok(t),
            Self::Tuple(items) => items.into_iter().next().ok_or_else(empty_tuple),
        }
    }

    /// Elements after the primary one (empty for [`Single`](Self::Single)).
    #[must_use]
    pub fn rest(&self) -> &[Tensor] {
        match self {
            Self::Single(_) => &[],
            Self::Tuple(items) => items.get(1..).unwrap_or(&[]),
        }
    }

    /// Whether the payload is a tuple.
    #[must_use]
    pub const fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    /// Apply `f` to the primary element, keeping the payload's shape.
    ///
    /// A [`Single`](Self::Single) maps to a `Single`; a
    /// [`Tuple`](Self::Tuple) maps to a tuple whose first element is
    /// replaced and whose remaining elements are carried over verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::Hook`] for an empty tuple and
    /// propagates any error from `f`.
    pub fn map_first<F>(&self, f: F) -> Result<Self>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        match self {
            Self::Single(t) => Ok(Self::Single(f(t)?)),
            Self::Tuple(items) => {
                let (first, rest) = items.split_first().ok_or_else(empty_tuple)?;
                let mut out = Vec::with_capacity(items.len());
                out.push(f(first)?);
                // BORROW: cheap clones, candle tensors share storage
                out.extend(rest.iter().cloned());
                Ok(Self::Tuple(out))
            }
        }
    }
}

impl From<Tensor> for HookPayload {
    fn from(t: Tensor) -> Self {
        Self::Single(t)
    }
}

/// Error for a tuple payload without a primary element.
fn empty_tuple() -> InterveneError {
    InterveneError::Hook("empty tuple payload has no primary element".into())
}

// ---------------------------------------------------------------------------
// Hook callbacks
// ---------------------------------------------------------------------------

/// Pre-call hook: sees the input, returns a replacement input or `None`.
pub type PreHookFn = Arc<dyn Fn(&HookPayload) -> Result<Option<HookPayload>> + Send + Sync>;

/// Post-call hook: sees input and output, returns a replacement output or `None`.
pub type PostHookFn =
    Arc<dyn Fn(&HookPayload, &HookPayload) -> Result<Option<HookPayload>> + Send + Sync>;

// ---------------------------------------------------------------------------
// HookHandle
// ---------------------------------------------------------------------------

/// Revocable registration of a hook at one interception point.
///
/// [`release`](Self::release) deregisters the hook; later calls are no-ops.
/// Dropping an unreleased handle releases it, so a handle must be kept
/// alive for as long as its hook should fire.
#[must_use = "dropping a HookHandle releases its hook immediately"]
pub struct HookHandle {
    /// Where the hook is attached.
    point: HookPoint,
    /// Deregistration action; `None` once released.
    // TRAIT_OBJECT: hosts implement deregistration however their hook table works
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl HookHandle {
    /// Create a handle whose release runs `release` exactly once.
    pub fn new<F>(point: HookPoint, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            point,
            release: Some(Box::new(release)),
        }
    }

    /// The interception point this handle is attached to.
    #[must_use]
    pub const fn point(&self) -> &HookPoint {
        &self.point
    }

    /// Whether [`release`](Self::release) has already run.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Deregister the hook. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("point", &self.point)
            .field("released", &self.is_released())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HookHandleSet
// ---------------------------------------------------------------------------

/// The hooks a session has installed, in installation order.
///
/// Dropping the set releases every handle still in it.
#[derive(Debug, Default)]
pub struct HookHandleSet {
    /// Installed handles.
    handles: Vec<HookHandle>,
}

impl HookHandleSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty set with room for `n` handles.
    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self {
            handles: Vec::with_capacity(n),
        }
    }

    /// Record an installed handle.
    pub fn push(&mut self, handle: HookHandle) {
        self.handles.push(handle);
    }

    /// Number of recorded handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handles are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Interception points of the recorded handles, in installation order.
    pub fn points(&self) -> impl Iterator<Item = &HookPoint> {
        self.handles.iter().map(HookHandle::point)
    }

    /// Release every handle and empty the set. Returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let n = self.handles.len();
        for mut handle in self.handles.drain(..) {
            handle.release();
        }
        n
    }
}

// ---------------------------------------------------------------------------
// HookableModule
// ---------------------------------------------------------------------------

/// A model component that accepts pre-call and/or post-call hooks.
///
/// Hooks on one component fire in registration order, each seeing the
/// replacement produced by the previous one. Components that do not support
/// one of the two kinds keep the default, which reports
/// [`InterveneError::StructuralMismatch`].
pub trait HookableModule {
    /// Register a hook that fires before the component computes.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::StructuralMismatch`] if the component has
    /// no pre-call interception point.
    fn register_pre_hook(&self, point: HookPoint, _hook: PreHookFn) -> Result<HookHandle> {
        Err(InterveneError::StructuralMismatch(format!(
            "`{point}` does not accept pre-call hooks"
        )))
    }

    /// Register a hook that fires right after the component computes.
    ///
    /// # Errors
    ///
    /// Returns [`InterveneError::StructuralMismatch`] if the component has
    /// no post-call interception point.
    fn register_post_hook(&self, point: HookPoint, _hook: PostHookFn) -> Result<HookHandle> {
        Err(InterveneError::StructuralMismatch(format!(
            "`{point}` does not accept post-call hooks"
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use candle_core::Device;

    use super::*;

    fn scalar(v: f32) -> Tensor {
        Tensor::new(&[v], &Device::Cpu).unwrap()
    }

    #[test]
    fn hook_point_display_roundtrip() {
        let cases = [
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::AttnOut(7), "blocks.7.hook_attn_out"),
            (HookPoint::MlpOut(31), "blocks.31.hook_mlp_out"),
        ];
        for (hook, expected) in cases {
            assert_eq!(hook.to_string(), expected);
            let parsed: HookPoint = expected.parse().unwrap();
            assert_eq!(parsed, hook);
            assert_eq!(HookPoint::from(expected), hook);
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "blocks.3.attn.hook_pattern".parse().unwrap();
        assert_eq!(hook, HookPoint::Custom("blocks.3.attn.hook_pattern".into()));
        assert_eq!(hook.layer(), None);
        assert_eq!(HookPoint::MlpOut(4).layer(), Some(4));
    }

    #[test]
    fn map_first_keeps_tuple_tail() {
        let payload = HookPayload::Tuple(vec![scalar(1.0), scalar(2.0), scalar(3.0)]);
        let mapped = payload.map_first(|t| Ok((t * 10.0)?)).unwrap();

        assert!(mapped.is_tuple());
        let first: Vec<f32> = mapped.primary().unwrap().to_vec1().unwrap();
        assert_eq!(first, vec![10.0]);
        let rest: Vec<Vec<f32>> = mapped.rest().iter().map(|t| t.to_vec1().unwrap()).collect();
        assert_eq!(rest, vec![vec![2.0], vec![3.0]]);
    }

    #[test]
    fn map_first_on_single_stays_single() {
        let payload = HookPayload::from(scalar(4.0));
        let mapped = payload.map_first(|t| Ok((t + 1.0)?)).unwrap();
        assert!(!mapped.is_tuple());
        assert!(mapped.rest().is_empty());
        let v: Vec<f32> = mapped.into_primary().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![5.0]);
    }

    #[test]
    fn empty_tuple_is_hook_error() {
        let payload = HookPayload::Tuple(Vec::new());
        assert!(matches!(payload.primary(), Err(InterveneError::Hook(_))));
        assert!(payload.map_first(|t| Ok(t.clone())).is_err());
    }

    #[test]
    fn handle_releases_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut handle = HookHandle::new(HookPoint::ResidPre(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!handle.is_released());
        handle.release();
        handle.release();
        assert!(handle.is_released());
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_set_releases_all_and_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let make = |i: usize| {
            let counter = Arc::clone(&calls);
            HookHandle::new(HookPoint::AttnOut(i), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        let mut set = HookHandleSet::with_capacity(3);
        set.push(make(0));
        set.push(make(1));
        let points: Vec<String> = set.points().map(ToString::to_string).collect();
        assert_eq!(points, vec!["blocks.0.hook_attn_out", "blocks.1.hook_attn_out"]);

        assert_eq!(set.release_all(), 2);
        assert!(set.is_empty());
        assert_eq!(set.release_all(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        set.push(make(2));
        drop(set);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn default_registration_is_structural_mismatch() {
        struct Opaque;
        impl HookableModule for Opaque {}

        let hook: PreHookFn = Arc::new(|_: &HookPayload| Ok(None));
        let err = Opaque
            .register_pre_hook(HookPoint::ResidPre(0), hook)
            .unwrap_err();
        assert!(matches!(err, InterveneError::StructuralMismatch(_)));
    }
}
