// SPDX-License-Identifier: MIT OR Apache-2.0

//! Patch and ablate a toy hooked transformer stack.
//!
//! ```bash
//! RUST_LOG=candle_intervene=debug cargo run --example patch_and_ablate
//! ```
//!
//! Builds a small residual stack from randomly initialized `candle_nn`
//! linear layers, then runs it plain, with a patch on one layer's input,
//! and with a direction ablated everywhere, printing how much of the
//! final hidden state lies along the direction.

use candle_core::{DType, Device, Tensor};
use candle_intervene::{
    AblationSession, HookedBlock, HookedModule, HookedStack, InterventionConfig, PatchingSession,
    ops,
};
use candle_nn::{VarBuilder, VarMap};

const NUM_LAYERS: usize = 4;
const HIDDEN: usize = 8;
const SEQ_LEN: usize = 5;

const EXPERIMENT: &str = r#"[
    {"kind": "patch", "layer": 2},
    {"kind": "ablation", "rate": 1.0}
]"#;

fn build_stack(vb: &VarBuilder<'_>) -> candle_intervene::Result<HookedStack> {
    let mut blocks = Vec::with_capacity(NUM_LAYERS);
    for i in 0..NUM_LAYERS {
        let vb = vb.pp(format!("blocks.{i}"));
        let attn = candle_nn::linear_no_bias(HIDDEN, HIDDEN, vb.pp("attn"))?;
        let mlp = candle_nn::linear_no_bias(HIDDEN, HIDDEN, vb.pp("mlp"))?;
        blocks.push(HookedBlock::new(
            HookedModule::from_module(attn),
            HookedModule::from_module(mlp),
        ));
    }
    Ok(HookedStack::new(blocks))
}

/// Mean absolute component of `hidden` along `unit`.
fn along(hidden: &Tensor, unit: &Tensor) -> candle_intervene::Result<f32> {
    Ok(ops::project(hidden, unit)?
        .abs()?
        .mean_all()?
        .to_scalar::<f32>()?)
}

fn main() -> candle_intervene::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // 1. Build a toy model
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let stack = build_stack(&vb)?;
    println!("Toy stack: {NUM_LAYERS} layers, hidden size {HIDDEN}");

    let x = Tensor::randn(0.0_f32, 1.0, (1, SEQ_LEN, HIDDEN), &device)?;
    let direction = Tensor::randn(0.0_f32, 1.0, HIDDEN, &device)?;
    let unit = ops::normalize(&direction)?;

    // 2. Plain forward pass
    let baseline = stack.forward(&x)?;
    println!("\nbaseline      |h . d| = {:.4}", along(&baseline, &unit)?);

    // 3. Interventions from an experiment file
    let experiment: Vec<InterventionConfig> = serde_json::from_str(EXPERIMENT)
        .map_err(|e| candle_intervene::InterveneError::Config(format!("experiment: {e}")))?;

    for config in &experiment {
        match config {
            InterventionConfig::Patch(c) => {
                let delta = (&unit * 4.0)?;
                let mut session = PatchingSession::from_config(&stack, delta, c);
                let out = session.scope(|| stack.forward(&x))?;
                println!(
                    "patch layer {:<2} |h . d| = {:.4}",
                    c.layer,
                    along(&out, &unit)?
                );
            }
            InterventionConfig::Ablation(c) => {
                let mut session = AblationSession::from_config(&stack, &direction, c)?;
                let out = session.scope(|| stack.forward(&x))?;
                println!("ablate r={:<4} |h . d| = {:.4}", c.rate, along(&out, &unit)?);
            }
            other => println!("skipping unsupported intervention {other:?}"),
        }
    }

    // 4. Hooks are gone after each session
    let after = stack.forward(&x)?;
    println!("\nafter         |h . d| = {:.4}", along(&after, &unit)?);
    println!("active hooks: {}", stack.num_active_hooks());

    Ok(())
}
