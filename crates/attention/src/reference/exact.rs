//! Reference sigmoid attention kernel.
//!
//! The full `[batch, heads, q_len, k_len]` logit matrix is materialised in
//! `f32`, biased, squashed through an elementwise sigmoid and multiplied
//! with `v`. The result is cast back to the dtype of `v`.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, sigmoid};

use crate::core::{validate_qkv, AttentionKernel, KernelArgs, QkvDims, Result};
use crate::masks::{LogitBias, MaskGeometry};

/// Numerically exact kernel; materialises every logit.
#[derive(Debug, Default)]
pub struct ExactSigmoidAttention {
    first_call: OnceLock<()>,
}

impl ExactSigmoidAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttentionKernel for ExactSigmoidAttention {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn weighted_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        args: &KernelArgs<'_>,
    ) -> Result<Tensor> {
        args.validate()?;
        let dims = validate_qkv(q, k, v)?;

        if self.first_call.set(()).is_ok() {
            log::info!(
                "sigmoid_attention::reference init heads={} kv_heads={} head_dim={} v_dim={} causal={} window={} alibi={} dropout_p={}",
                dims.heads,
                dims.kv_heads,
                dims.head_dim,
                dims.v_dim,
                args.causal,
                args.window,
                args.alibi_slopes.is_some(),
                args.dropout_p
            );
        }

        let (qh, kh, vh) = heads_first(q, k, v, &dims)?;
        let scale = args.resolved_scale(dims.head_dim);
        let logits = qh
            .matmul(&kh.t()?)?
            .affine(scale, args.sigmoid_bias as f64)?;

        let geometry = MaskGeometry::new(dims.q_len, dims.k_len, args.causal, args.window);
        let bias = LogitBias::build(
            &geometry,
            args.alibi_slopes,
            dims.batch,
            dims.heads,
            0..dims.k_len,
            q.device(),
        )?;
        let weights = sigmoid(&bias.apply(&logits)?)?;
        let weights = weight_dropout(&weights, args.dropout_p)?;

        restore_layout(&weights.matmul(&vh)?, v.dtype())
    }
}

/// Moves `q`, `k`, `v` to `[batch, heads, seq, dim]` in `f32`, repeating
/// key/value heads across their query group.
pub(crate) fn heads_first(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    dims: &QkvDims,
) -> Result<(Tensor, Tensor, Tensor)> {
    let group = dims.group_size();
    let q = q.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?;
    let k = repeat_heads(&k.to_dtype(DType::F32)?.transpose(1, 2)?, group)?.contiguous()?;
    let v = repeat_heads(&v.to_dtype(DType::F32)?.transpose(1, 2)?, group)?.contiguous()?;
    Ok((q, k, v))
}

/// Query head `i` reads key/value head `i / group`.
fn repeat_heads(tensor: &Tensor, group: usize) -> Result<Tensor> {
    if group == 1 {
        return Ok(tensor.clone());
    }
    let (batch, heads, seq, dim) = tensor.dims4()?;
    Ok(tensor
        .unsqueeze(2)?
        .broadcast_as((batch, heads, group, seq, dim))?
        .reshape((batch, heads * group, seq, dim))?)
}

pub(crate) fn weight_dropout(weights: &Tensor, p: f32) -> Result<Tensor> {
    if p > 0.0 {
        Ok(dropout(weights, p)?)
    } else {
        Ok(weights.clone())
    }
}

/// `[batch, heads, q_len, v_dim]` back to `[batch, q_len, heads, v_dim]`.
pub(crate) fn restore_layout(out: &Tensor, dtype: DType) -> Result<Tensor> {
    Ok(out.transpose(1, 2)?.contiguous()?.to_dtype(dtype)?)
}
