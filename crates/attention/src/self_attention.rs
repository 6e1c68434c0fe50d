//! Sigmoid self-attention over a single sequence.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use layers::checks;
use layers::dtypes::cast_like;
use layers::{Dropout, LinearConfig, LinearLayer, NormKind, NormalizationLayer, PrecisionPolicy};
use serde::{Deserialize, Serialize};

use crate::components::{describe_transform, AttentionComponents, AttentionOutput};
use crate::core::{
    split_packed, AttentionError, AttentionKernel, AttentionPolicy, CallShape, KernelBackend,
    PositionalTransform, Result, DEFAULT_KERNEL_BACKEND,
};
use crate::functional::{packed_sigmoid_attention, sigmoid_attention};
use crate::interop::RotaryTransform;

/// Hyperparameters of [`SigmoidSelfAttention`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfAttentionConfig {
    pub dim: usize,
    pub num_heads: usize,
    /// Learnable bias on the qkv and output projections.
    pub bias: bool,
    /// Per-head normalisation of q and k.
    pub qk_norm: bool,
    pub norm_kind: NormKind,
    pub proj_dropout_p: f32,
    pub policy: AttentionPolicy,
    pub backend: KernelBackend,
    pub call_shape: CallShape,
}

impl Default for SelfAttentionConfig {
    fn default() -> Self {
        Self {
            dim: 0,
            num_heads: 8,
            bias: false,
            qk_norm: false,
            norm_kind: NormKind::default(),
            proj_dropout_p: 0.0,
            policy: AttentionPolicy::default().with_causal(true),
            backend: DEFAULT_KERNEL_BACKEND,
            call_shape: CallShape::Unpacked,
        }
    }
}

impl SelfAttentionConfig {
    /// Causal, prescaled attention with the given sigmoid bias.
    pub fn new(dim: usize, num_heads: usize, sigmoid_bias: f32) -> Self {
        let defaults = Self::default();
        Self {
            dim,
            num_heads,
            policy: defaults.policy.clone().with_sigmoid_bias(sigmoid_bias),
            ..defaults
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_qk_norm(mut self, qk_norm: bool) -> Self {
        self.qk_norm = qk_norm;
        self
    }

    pub fn with_norm_kind(mut self, kind: NormKind) -> Self {
        self.norm_kind = kind;
        self
    }

    pub fn with_proj_dropout(mut self, p: f32) -> Self {
        self.proj_dropout_p = p;
        self
    }

    pub fn with_policy(mut self, policy: AttentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backend(mut self, backend: KernelBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_call_shape(mut self, call_shape: CallShape) -> Self {
        self.call_shape = call_shape;
        self
    }

    /// Width of one head; only meaningful once [`validate`](Self::validate) passes.
    pub fn head_dim(&self) -> usize {
        self.dim / self.num_heads.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(AttentionError::configuration("num_heads must be non-zero"));
        }
        if self.dim == 0 || self.dim % self.num_heads != 0 {
            return Err(AttentionError::configuration(format!(
                "dim {} must be a positive multiple of num_heads {}",
                self.dim, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.proj_dropout_p) {
            return Err(AttentionError::configuration(format!(
                "projection dropout must be in [0, 1), got {}",
                self.proj_dropout_p
            )));
        }
        self.policy.validate(self.num_heads)
    }
}

/// Multi-head self-attention with per-pair sigmoid weights.
///
/// `forward` takes `[batch, seq, dim]` and returns both the flattened kernel
/// output and its projection, each `[batch, seq, dim]`.
#[derive(Debug)]
pub struct SigmoidSelfAttention {
    config: SelfAttentionConfig,
    precision: PrecisionPolicy,
    qkv: Arc<dyn LinearLayer>,
    q_norm: Arc<dyn NormalizationLayer>,
    k_norm: Arc<dyn NormalizationLayer>,
    positional: Option<Arc<dyn PositionalTransform>>,
    kernel: Arc<dyn AttentionKernel>,
    proj: Arc<dyn LinearLayer>,
    proj_dropout: Dropout,
}

impl SigmoidSelfAttention {
    pub fn new(config: SelfAttentionConfig, device: &Device, dtype: DType) -> Result<Self> {
        Self::with_components(config, AttentionComponents::default(), device, dtype)
    }

    /// Rotary positional transform over the full head width.
    pub fn with_rope(config: SelfAttentionConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let rope = RotaryTransform::for_head_dim(config.head_dim())?;
        let components = AttentionComponents::default().with_positional(Arc::new(rope));
        Self::with_components(config, components, device, dtype)
    }

    pub fn with_components(
        config: SelfAttentionConfig,
        components: AttentionComponents,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let head_dim = config.head_dim();

        let qkv = components
            .linear
            .build(
                LinearConfig::new(config.dim, config.dim)
                    .with_bias(config.bias)
                    .fused(3),
                device,
                dtype,
            )
            .map_err(|err| AttentionError::configuration(format!("qkv projection: {err}")))?;
        let proj = components
            .linear
            .build(
                LinearConfig::new(config.dim, config.dim).with_bias(config.bias),
                device,
                dtype,
            )
            .map_err(|err| AttentionError::configuration(format!("output projection: {err}")))?;
        let q_norm =
            components.build_norm(config.qk_norm, config.norm_kind, head_dim, device, dtype)?;
        let k_norm =
            components.build_norm(config.qk_norm, config.norm_kind, head_dim, device, dtype)?;
        let kernel = components.resolve_kernel(config.backend)?;
        let proj_dropout = Dropout::new(config.proj_dropout_p)
            .map_err(|err| AttentionError::configuration(err.to_string()))?;

        let layer = Self {
            precision: PrecisionPolicy::from_parameter_dtype(dtype),
            qkv,
            q_norm,
            k_norm,
            positional: components.positional,
            kernel,
            proj,
            proj_dropout,
            config,
        };
        log::info!("sigmoid_attention::self init {layer}");
        Ok(layer)
    }

    pub fn config(&self) -> &SelfAttentionConfig {
        &self.config
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Training-mode forward pass; both dropouts are live.
    pub fn forward(&self, x: &Tensor) -> Result<AttentionOutput> {
        self.forward_t(x, true)
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<AttentionOutput> {
        checks::expect_batch_seq_hidden("self_attention.input", x, self.config.dim)
            .map_err(|err| AttentionError::shape(err.to_string()))?;
        let (batch, seq, _) = x.dims3()?;

        let qkv = self.qkv.forward(x, &self.precision)?.reshape((
            batch,
            seq,
            3,
            self.config.num_heads,
            self.config.head_dim(),
        ))?;
        let (q, k, v) = split_packed(&qkv)?;
        let q = self.q_norm.forward(&q, &self.precision)?;
        let k = self.k_norm.forward(&k, &self.precision)?;
        let (q, k) = match &self.positional {
            Some(transform) => transform.apply(&q, &k, 0, 0)?,
            None => (q, k),
        };
        let q = cast_like(&q, &v)?;
        let k = cast_like(&k, &v)?;

        let attn_times_v = match self.config.call_shape {
            CallShape::Unpacked => sigmoid_attention(
                self.kernel.as_ref(),
                &q,
                &k,
                &v,
                &self.config.policy,
                train,
            )?,
            CallShape::Packed => {
                let packed = Tensor::stack(&[&q, &k, &v], 2)?;
                packed_sigmoid_attention(self.kernel.as_ref(), &packed, &self.config.policy, train)?
            }
        };
        let projected = self.proj.forward(&attn_times_v, &self.precision)?;
        let attn_proj = self.proj_dropout.forward_t(&projected, train)?;
        Ok(AttentionOutput {
            attn_times_v,
            attn_proj,
        })
    }
}

impl fmt::Display for SigmoidSelfAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SigmoidSelfAttention(dim={}, heads={}, head_dim={}, {}, proj_drop={}, qk_norm={}, bias={}, backend={}, kernel={}, call_shape={:?}, transform={})",
            self.config.dim,
            self.config.num_heads,
            self.config.head_dim(),
            self.config.policy,
            self.config.proj_dropout_p,
            self.config.qk_norm,
            self.config.bias,
            self.config.backend,
            self.kernel.name(),
            self.config.call_shape,
            describe_transform(&self.positional)
        )
    }
}

/// Evaluation-mode forward returning `attn_proj`.
impl candle_nn::Module for SigmoidSelfAttention {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_t(xs, false)
            .map(|out| out.attn_proj)
            .map_err(candle_core::Error::wrap)
    }
}
