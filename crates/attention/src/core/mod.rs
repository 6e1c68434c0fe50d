//! Core traits and types shared across sigmoid attention kernels.
//!
//! Kernels consume tensors laid out as `[batch, seq_len, heads, head_dim]`
//! (or the packed `[batch, seq_len, 3, heads, head_dim]`) and return
//! `[batch, q_len, heads, v_dim]` in the dtype of `v`. Every query/key pair
//! gets an independent sigmoid weight; rows are never renormalised, so a
//! fully masked row produces zeros.

pub mod config;
pub mod errors;

use std::fmt;

use candle_core::{DType, Tensor};

pub use config::{
    AlibiSlopes, AttentionPolicy, CallShape, KernelBackend, WindowSize, BACKEND_ENV_VAR,
    DEFAULT_KERNEL_BACKEND,
};
pub use errors::{AttentionError, Result};

/// Per-call arguments handed to a kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelArgs<'a> {
    pub sigmoid_bias: f32,
    /// Dropout on the weights; `0.0` disables it.
    pub dropout_p: f32,
    pub window: WindowSize,
    pub alibi_slopes: Option<&'a AlibiSlopes>,
    pub causal: bool,
    /// `None` selects the kernel default `head_dim^-0.5`.
    pub softmax_scale: Option<f32>,
}

impl<'a> KernelArgs<'a> {
    /// Unmasked, non-causal arguments with no dropout.
    pub fn new(sigmoid_bias: f32) -> Self {
        Self {
            sigmoid_bias,
            dropout_p: 0.0,
            window: WindowSize::UNBOUNDED,
            alibi_slopes: None,
            causal: false,
            softmax_scale: None,
        }
    }

    /// Arguments for a layer call; dropout only survives in training mode.
    /// The scale is left to the caller since it depends on prescaling.
    pub fn from_policy(policy: &'a AttentionPolicy, train: bool) -> Self {
        Self {
            sigmoid_bias: policy.sigmoid_bias,
            dropout_p: if train { policy.attn_dropout_p } else { 0.0 },
            window: policy.window,
            alibi_slopes: policy.alibi_slopes.as_ref(),
            causal: policy.causal,
            softmax_scale: None,
        }
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_window(mut self, window: WindowSize) -> Self {
        self.window = window;
        self
    }

    pub fn with_alibi(mut self, slopes: &'a AlibiSlopes) -> Self {
        self.alibi_slopes = Some(slopes);
        self
    }

    pub fn with_dropout(mut self, p: f32) -> Self {
        self.dropout_p = p;
        self
    }

    pub fn with_softmax_scale(mut self, scale: Option<f32>) -> Self {
        self.softmax_scale = scale;
        self
    }

    /// Rejects policies no kernel can express.
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(AttentionError::unsupported(format!(
                "dropout probability must be in [0, 1), got {}",
                self.dropout_p
            )));
        }
        Ok(())
    }

    /// Logit scale for the given head width.
    pub fn resolved_scale(&self, head_dim: usize) -> f64 {
        match self.softmax_scale {
            Some(scale) => scale as f64,
            None => 1.0 / (head_dim as f64).sqrt(),
        }
    }
}

/// Validated geometry of one kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QkvDims {
    pub batch: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub v_dim: usize,
}

impl QkvDims {
    /// How many query heads share one key/value head.
    pub fn group_size(&self) -> usize {
        self.heads / self.kv_heads
    }

    /// Shift aligning the last query with the last key.
    pub fn offset(&self) -> i64 {
        self.k_len as i64 - self.q_len as i64
    }
}

/// Checks device, dtype and shape agreement between `q`, `k` and `v`.
pub fn validate_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<QkvDims> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape(
            "q, k, v must reside on the same device",
        ));
    }

    let dtype = q.dtype();
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::UnsupportedDType {
            requested: format!(
                "mixed q/k/v dtypes {dtype:?}/{:?}/{:?}",
                k.dtype(),
                v.dtype()
            ),
        });
    }

    let (batch, q_len, heads, head_dim) = q
        .dims4()
        .map_err(|_| AttentionError::shape(format!("q must be [batch, seq, heads, head_dim], got {:?}", q.dims())))?;
    let (kb, k_len, kv_heads, kd) = k
        .dims4()
        .map_err(|_| AttentionError::shape(format!("k must be [batch, seq, heads, head_dim], got {:?}", k.dims())))?;
    let (vb, vk, vh, v_dim) = v
        .dims4()
        .map_err(|_| AttentionError::shape(format!("v must be [batch, seq, heads, head_dim], got {:?}", v.dims())))?;

    if kb != batch || kd != head_dim {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: expected [{batch}, ?, ?, {head_dim}] got [{kb}, {k_len}, {kv_heads}, {kd}]"
        )));
    }
    if vb != batch || vk != k_len || vh != kv_heads {
        return Err(AttentionError::shape(format!(
            "v shape mismatch: expected [{batch}, {k_len}, {kv_heads}, ?] got [{vb}, {vk}, {vh}, {v_dim}]"
        )));
    }
    if kv_heads == 0 || heads % kv_heads != 0 {
        return Err(AttentionError::shape(format!(
            "{heads} query heads cannot share {kv_heads} key/value heads"
        )));
    }

    Ok(QkvDims {
        batch,
        q_len,
        k_len,
        heads,
        kv_heads,
        head_dim,
        v_dim,
    })
}

/// Splits a packed `[batch, seq, 3, heads, head_dim]` tensor into q, k, v.
pub fn split_packed(qkv: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    let (_, _, three, _, _) = qkv.dims5().map_err(|_| {
        AttentionError::shape(format!(
            "packed qkv must be [batch, seq, 3, heads, head_dim], got {:?}",
            qkv.dims()
        ))
    })?;
    if three != 3 {
        return Err(AttentionError::shape(format!(
            "packed qkv axis 2 must hold 3 entries, got {three}"
        )));
    }
    let slice = |index: usize| -> Result<Tensor> {
        Ok(qkv.narrow(2, index, 1)?.squeeze(2)?.contiguous()?)
    };
    Ok((slice(0)?, slice(1)?, slice(2)?))
}

/// A primitive computing sigmoid-weighted attention.
pub trait AttentionKernel: Send + Sync + fmt::Debug {
    /// Short identifier used in logs and layer summaries.
    fn name(&self) -> &'static str;

    /// `q: [b, q_len, h, d]`, `k: [b, k_len, h_kv, d]`, `v: [b, k_len, h_kv, d_v]`
    /// with `h % h_kv == 0`. Returns `[b, q_len, h, d_v]`.
    fn weighted_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        args: &KernelArgs<'_>,
    ) -> Result<Tensor>;

    /// Packed entry point; `qkv` is `[b, seq, 3, h, d]`.
    fn weighted_attention_packed(&self, qkv: &Tensor, args: &KernelArgs<'_>) -> Result<Tensor> {
        let (q, k, v) = split_packed(qkv)?;
        self.weighted_attention(&q, &k, &v, args)
    }
}

/// Position-dependent rewrite of queries and keys applied before weighting.
///
/// Inputs are `[batch, seq, heads, head_dim]`; outputs keep their shapes.
pub trait PositionalTransform: Send + Sync + fmt::Debug {
    fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        q_pos_offset: usize,
        k_pos_offset: usize,
    ) -> Result<(Tensor, Tensor)>;

    /// Label shown in layer summaries.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn grouped_heads_are_accepted() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((2, 3, 4, 8), DType::F32, &device)?;
        let k = Tensor::zeros((2, 5, 2, 8), DType::F32, &device)?;
        let v = Tensor::zeros((2, 5, 2, 6), DType::F32, &device)?;
        let dims = validate_qkv(&q, &k, &v)?;
        assert_eq!(dims.group_size(), 2);
        assert_eq!(dims.offset(), 2);
        assert_eq!(dims.v_dim, 6);
        Ok(())
    }

    #[test]
    fn indivisible_heads_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 3, 3, 8), DType::F32, &device)?;
        let k = Tensor::zeros((1, 3, 2, 8), DType::F32, &device)?;
        let v = Tensor::zeros((1, 3, 2, 8), DType::F32, &device)?;
        assert!(matches!(
            validate_qkv(&q, &k, &v),
            Err(AttentionError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn mixed_dtypes_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 1, 4), DType::F32, &device)?;
        let k = Tensor::zeros((1, 2, 1, 4), DType::BF16, &device)?;
        let v = Tensor::zeros((1, 2, 1, 4), DType::F32, &device)?;
        assert!(matches!(
            validate_qkv(&q, &k, &v),
            Err(AttentionError::UnsupportedDType { .. })
        ));
        Ok(())
    }

    #[test]
    fn kernel_args_follow_training_mode() {
        let policy = AttentionPolicy::default().with_attn_dropout(0.3).with_causal(true);
        assert_eq!(KernelArgs::from_policy(&policy, true).dropout_p, 0.3);
        let eval = KernelArgs::from_policy(&policy, false);
        assert_eq!(eval.dropout_p, 0.0);
        assert!(eval.causal);
        assert!((eval.resolved_scale(16) - 0.25).abs() < 1e-12);
        assert_eq!(eval.with_softmax_scale(Some(1.0)).resolved_scale(16), 1.0);
    }

    #[test]
    fn kernel_args_reject_invalid_policies() {
        let bad_window = KernelArgs::new(0.0).with_window(WindowSize::new(0, -3));
        assert!(matches!(
            bad_window.validate(),
            Err(AttentionError::UnsupportedConfiguration { .. })
        ));
        let bad_dropout = KernelArgs::new(0.0).with_dropout(1.5);
        assert!(matches!(
            bad_dropout.validate(),
            Err(AttentionError::UnsupportedConfiguration { .. })
        ));
    }

    #[test]
    fn packed_split_requires_three_entries() -> Result<()> {
        let device = Device::Cpu;
        let qkv = Tensor::zeros((1, 4, 2, 2, 8), DType::F32, &device)?;
        assert!(split_packed(&qkv).is_err());
        let qkv = Tensor::zeros((1, 4, 3, 2, 8), DType::F32, &device)?;
        let (q, k, v) = split_packed(&qkv)?;
        assert_eq!(q.dims(), &[1, 4, 2, 8]);
        assert_eq!(k.dims(), v.dims());
        Ok(())
    }
}
