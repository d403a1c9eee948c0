// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-intervene
//!
//! Scoped, hook-based interventions on transformer activations, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! Two interventions are provided, both installed as hooks on a model's
//! decoder layers and removed again when the session ends:
//!
//! - [`PatchingSession`] adds a fixed delta to the input of one layer.
//! - [`AblationSession`] removes a direction from every layer's input and
//!   from every attention and feed-forward output.
//!
//! A model takes part by implementing [`LayerStack`] and [`DecoderLayer`].
//! The [`hooked`] module provides a small reference host ([`HookedStack`])
//! that wraps ordinary candle modules.
//!
//! ```
//! use candle_core::{Device, Tensor};
//! use candle_intervene::{AblationSession, HookedBlock, HookedModule, HookedStack};
//!
//! let block = HookedBlock::new(
//!     HookedModule::from_module(|x: &Tensor| x.copy()),
//!     HookedModule::from_module(|x: &Tensor| x.copy()),
//! );
//! let stack = HookedStack::new(vec![block]);
//! let direction = Tensor::new(&[1.0_f32, 0.0], &Device::Cpu)?;
//! let x = Tensor::new(&[[[3.0_f32, 4.0]]], &Device::Cpu)?;
//!
//! let mut session = AblationSession::new(&stack, &direction)?;
//! let out = session.scope(|| stack.forward(&x))?;
//! let first: Vec<f32> = out.flatten_all()?.to_vec1()?;
//! assert!(first[0].abs() < 1e-6);
//! assert_eq!(stack.num_active_hooks(), 0);
//! # Ok::<(), candle_intervene::InterveneError>(())
//! ```

pub mod ablation;
pub mod config;
pub mod direction;
pub mod error;
pub mod hooked;
pub mod hooks;
pub mod model;
pub mod ops;
pub mod patch;

pub use ablation::AblationSession;
pub use config::{
    AblationConfig, DEFAULT_ABLATION_RATE, DEFAULT_PATCH_LAYER, InterventionConfig, PatchConfig,
};
pub use direction::Direction;
pub use error::{InterveneError, Result};
pub use hooked::{HookRegistry, HookedBlock, HookedModule, HookedStack};
pub use hooks::{
    HookHandle, HookHandleSet, HookPayload, HookPoint, HookableModule, PostHookFn, PreHookFn,
};
pub use model::{DecoderLayer, LayerStack};
pub use patch::PatchingSession;
