//! Runs sigmoid self- and cross-attention on synthetic batches.
//!
//! Usage: `sigmoid-attention-demo [self-attention-config.json]`. Set
//! `RUST_LOG=debug` to see kernel selection and rotary cache activity.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use sigmoid_attention::{
    CrossAttentionConfig, SelfAttentionConfig, SigmoidCrossAttention, SigmoidSelfAttention,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let device = Device::Cpu;

    let config = match std::env::args().nth(1) {
        Some(path) => load_config(&path)?,
        None => SelfAttentionConfig::new(8, 2, -4.0),
    };
    run_self_attention(config, &device)?;
    run_cross_attention(&device)?;
    Ok(())
}

fn load_config(path: &str) -> Result<SelfAttentionConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

fn run_self_attention(config: SelfAttentionConfig, device: &Device) -> Result<()> {
    let (batch, seq) = (2, 4);
    let layer = SigmoidSelfAttention::new(config.clone(), device, DType::F32)?;
    let x = Tensor::randn(0f32, 1.0, (batch, seq, config.dim), device)?;
    let out = layer.forward_t(&x, false)?;
    log::info!(
        "self-attention {:?} -> attn_times_v {:?}, attn_proj {:?}",
        x.dims(),
        out.attn_times_v.dims(),
        out.attn_proj.dims()
    );

    if config.policy.causal && seq > 1 {
        let tail = Tensor::randn(0f32, 1.0, (batch, seq - 1, config.dim), device)?;
        let perturbed = Tensor::cat(&[&x.narrow(1, 0, 1)?, &tail], 1)?;
        let again = layer.forward_t(&perturbed, false)?;
        let drift = out
            .attn_proj
            .narrow(1, 0, 1)?
            .sub(&again.attn_proj.narrow(1, 0, 1)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()?;
        log::info!("position 0 drift after rewriting later tokens: {drift:e}");
    }
    Ok(())
}

fn run_cross_attention(device: &Device) -> Result<()> {
    let layer = SigmoidCrossAttention::with_rope(
        CrossAttentionConfig::new(8, 12, 2, -4.0),
        device,
        DType::F32,
    )?;
    let queries = Tensor::randn(0f32, 1.0, (2, 3, 8), device)?;
    let context = Tensor::randn(0f32, 1.0, (2, 5, 12), device)?;
    let out = layer.forward_t(&queries, &context, false)?;
    log::info!(
        "cross-attention {:?} x {:?} -> attn_times_v {:?}, attn_proj {:?}",
        queries.dims(),
        context.dims(),
        out.attn_times_v.dims(),
        out.attn_proj.dims()
    );
    Ok(())
}
