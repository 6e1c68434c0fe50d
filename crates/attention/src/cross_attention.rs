//! Sigmoid cross-attention: queries from one sequence, keys and values from
//! another.
//!
//! Keys live in the query space, so each head compares `q_dim / heads` wide
//! vectors, while values keep `kv_dim / heads` features per head. The fused
//! key/value projection therefore maps `kv_dim -> q_dim + kv_dim`; when the
//! two widths agree this is the usual `2 * kv_dim` projection. Values are
//! always normalised per head; queries and keys only with `qk_norm`.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use layers::checks;
use layers::dtypes::cast_like;
use layers::{Dropout, LinearConfig, LinearLayer, NormKind, NormalizationLayer, PrecisionPolicy};
use serde::{Deserialize, Serialize};

use crate::components::{describe_transform, AttentionComponents, AttentionOutput};
use crate::core::{
    AttentionError, AttentionKernel, AttentionPolicy, KernelBackend, PositionalTransform, Result,
    DEFAULT_KERNEL_BACKEND,
};
use crate::functional::sigmoid_attention;
use crate::interop::RotaryTransform;

/// Hyperparameters of [`SigmoidCrossAttention`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossAttentionConfig {
    pub q_dim: usize,
    pub kv_dim: usize,
    pub num_heads: usize,
    pub bias: bool,
    pub qk_norm: bool,
    pub norm_kind: NormKind,
    pub proj_dropout_p: f32,
    pub policy: AttentionPolicy,
    pub backend: KernelBackend,
}

impl Default for CrossAttentionConfig {
    fn default() -> Self {
        Self {
            q_dim: 0,
            kv_dim: 0,
            num_heads: 8,
            bias: false,
            qk_norm: false,
            norm_kind: NormKind::default(),
            proj_dropout_p: 0.0,
            policy: AttentionPolicy::default().with_causal(true),
            backend: DEFAULT_KERNEL_BACKEND,
        }
    }
}

impl CrossAttentionConfig {
    pub fn new(q_dim: usize, kv_dim: usize, num_heads: usize, sigmoid_bias: f32) -> Self {
        let defaults = Self::default();
        Self {
            q_dim,
            kv_dim,
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

    /// Per-head width of queries and keys.
    pub fn head_dim_q(&self) -> usize {
        self.q_dim / self.num_heads.max(1)
    }

    /// Per-head width of values.
    pub fn head_dim_kv(&self) -> usize {
        self.kv_dim / self.num_heads.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(AttentionError::configuration("num_heads must be non-zero"));
        }
        for (label, width) in [("q_dim", self.q_dim), ("kv_dim", self.kv_dim)] {
            if width == 0 || width % self.num_heads != 0 {
                return Err(AttentionError::configuration(format!(
                    "{label} {width} must be a positive multiple of num_heads {}",
                    self.num_heads
                )));
            }
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

/// Multi-head cross-attention with per-pair sigmoid weights.
#[derive(Debug)]
pub struct SigmoidCrossAttention {
    config: CrossAttentionConfig,
    precision: PrecisionPolicy,
    q_proj: Arc<dyn LinearLayer>,
    kv_proj: Arc<dyn LinearLayer>,
    q_norm: Arc<dyn NormalizationLayer>,
    k_norm: Arc<dyn NormalizationLayer>,
    v_norm: Arc<dyn NormalizationLayer>,
    positional: Option<Arc<dyn PositionalTransform>>,
    kernel: Arc<dyn AttentionKernel>,
    proj: Arc<dyn LinearLayer>,
    proj_dropout: Dropout,
}

impl SigmoidCrossAttention {
    pub fn new(config: CrossAttentionConfig, device: &Device, dtype: DType) -> Result<Self> {
        Self::with_components(config, AttentionComponents::default(), device, dtype)
    }

    /// Rotary positional transform over the query/key head width.
    pub fn with_rope(config: CrossAttentionConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let rope = RotaryTransform::for_head_dim(config.head_dim_q())?;
        let components = AttentionComponents::default().with_positional(Arc::new(rope));
        Self::with_components(config, components, device, dtype)
    }

    pub fn with_components(
        config: CrossAttentionConfig,
        components: AttentionComponents,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let linear = |label: &str, input: usize, output: usize| {
            components
                .linear
                .build(
                    LinearConfig::new(input, output).with_bias(config.bias),
                    device,
                    dtype,
                )
                .map_err(|err| AttentionError::configuration(format!("{label}: {err}")))
        };
        let q_proj = linear("query projection", config.q_dim, config.q_dim)?;
        let kv_proj = linear(
            "key/value projection",
            config.kv_dim,
            config.q_dim + config.kv_dim,
        )?;
        let proj = linear("output projection", config.kv_dim, config.q_dim)?;

        let head_dim_q = config.head_dim_q();
        let q_norm =
            components.build_norm(config.qk_norm, config.norm_kind, head_dim_q, device, dtype)?;
        let k_norm =
            components.build_norm(config.qk_norm, config.norm_kind, head_dim_q, device, dtype)?;
        let v_norm = components.build_norm(
            true,
            config.norm_kind,
            config.head_dim_kv(),
            device,
            dtype,
        )?;
        let kernel = components.resolve_kernel(config.backend)?;
        let proj_dropout = Dropout::new(config.proj_dropout_p)
            .map_err(|err| AttentionError::configuration(err.to_string()))?;

        let layer = Self {
            precision: PrecisionPolicy::from_parameter_dtype(dtype),
            q_proj,
            kv_proj,
            q_norm,
            k_norm,
            v_norm,
            positional: components.positional,
            kernel,
            proj,
            proj_dropout,
            config,
        };
        log::info!("sigmoid_attention::cross init {layer}");
        Ok(layer)
    }

    pub fn config(&self) -> &CrossAttentionConfig {
        &self.config
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Training-mode forward pass; both dropouts are live.
    pub fn forward(&self, q_input: &Tensor, kv_input: &Tensor) -> Result<AttentionOutput> {
        self.forward_t(q_input, kv_input, true)
    }

    /// `q_input: [batch, q_len, q_dim]`, `kv_input: [batch, kv_len, kv_dim]`.
    /// `attn_times_v` is `[batch, q_len, kv_dim]`, `attn_proj` is
    /// `[batch, q_len, q_dim]`.
    pub fn forward_t(
        &self,
        q_input: &Tensor,
        kv_input: &Tensor,
        train: bool,
    ) -> Result<AttentionOutput> {
        let cfg = &self.config;
        let (batch, q_len) = expect_input("q_input", q_input, cfg.q_dim)?;
        let (kv_batch, kv_len) = expect_input("kv_input", kv_input, cfg.kv_dim)?;
        if kv_batch != batch {
            return Err(AttentionError::shape(format!(
                "q_input batch {batch} differs from kv_input batch {kv_batch}"
            )));
        }
        let heads = cfg.num_heads;

        let q = self
            .q_proj
            .forward(q_input, &self.precision)?
            .reshape((batch, q_len, heads, cfg.head_dim_q()))?;
        let kv = self.kv_proj.forward(kv_input, &self.precision)?;
        let k = kv
            .narrow(2, 0, cfg.q_dim)?
            .reshape((batch, kv_len, heads, cfg.head_dim_q()))?;
        let v = kv
            .narrow(2, cfg.q_dim, cfg.kv_dim)?
            .reshape((batch, kv_len, heads, cfg.head_dim_kv()))?;

        let q = self.q_norm.forward(&q, &self.precision)?;
        let k = self.k_norm.forward(&k, &self.precision)?;
        let v = self.v_norm.forward(&v, &self.precision)?;
        let (q, k) = match &self.positional {
            Some(transform) => transform.apply(&q, &k, 0, 0)?,
            None => (q, k),
        };
        let q = cast_like(&q, &v)?;
        let k = cast_like(&k, &v)?;

        let attn_times_v =
            sigmoid_attention(self.kernel.as_ref(), &q, &k, &v, &cfg.policy, train)?;
        let projected = self.proj.forward(&attn_times_v, &self.precision)?;
        let attn_proj = self.proj_dropout.forward_t(&projected, train)?;
        Ok(AttentionOutput {
            attn_times_v,
            attn_proj,
        })
    }
}

fn expect_input(label: &str, input: &Tensor, width: usize) -> Result<(usize, usize)> {
    checks::expect_batch_seq_hidden(label, input, width)
        .map_err(|err| AttentionError::shape(err.to_string()))?;
    let (batch, seq, _) = input.dims3()?;
    Ok((batch, seq))
}

impl fmt::Display for SigmoidCrossAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SigmoidCrossAttention(q_dim={}, kv_dim={}, heads={}, head_dim_q={}, head_dim_kv={}, {}, proj_drop={}, qk_norm={}, bias={}, backend={}, kernel={}, transform={})",
            self.config.q_dim,
            self.config.kv_dim,
            self.config.num_heads,
            self.config.head_dim_q(),
            self.config.head_dim_kv(),
            self.config.policy,
            self.config.proj_dropout_p,
            self.config.qk_norm,
            self.config.bias,
            self.config.backend,
            self.kernel.name(),
            describe_transform(&self.positional)
        )
    }
}
