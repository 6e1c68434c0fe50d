//! Attention policy knobs shared by the kernels and the layers.
//!
//! [`AttentionPolicy`] is fixed when a layer is built and travels with every
//! forward call. Window bounds follow the usual flash-attention convention:
//! `-1` on either side means unbounded, and both bounds are measured relative
//! to the query row aligned to the end of the key sequence.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Environment variable that overrides the configured kernel backend.
pub const BACKEND_ENV_VAR: &str = "SIGMOID_ATTN_BACKEND";

/// Backend used by both layer configs unless a caller picks another one.
pub const DEFAULT_KERNEL_BACKEND: KernelBackend = KernelBackend::Reference;

/// Sliding-window bounds around the aligned diagonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub left: i64,
    pub right: i64,
}

impl WindowSize {
    /// No locality restriction on either side.
    pub const UNBOUNDED: WindowSize = WindowSize {
        left: -1,
        right: -1,
    };

    pub fn new(left: i64, right: i64) -> Self {
        Self { left, right }
    }

    pub fn is_unbounded_left(&self) -> bool {
        self.left < 0
    }

    pub fn is_unbounded_right(&self) -> bool {
        self.right < 0
    }

    pub fn is_unbounded(&self) -> bool {
        self.is_unbounded_left() && self.is_unbounded_right()
    }

    /// Rejects bounds below the `-1` sentinel.
    pub fn validate(&self) -> Result<()> {
        if self.left < -1 || self.right < -1 {
            return Err(AttentionError::unsupported(format!(
                "window bounds must be >= -1, got ({}, {})",
                self.left, self.right
            )));
        }
        Ok(())
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.left, self.right)
    }
}

/// ALiBi slopes, either shared across the batch or given per batch element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlibiSlopes {
    /// One slope per head.
    PerHead(Vec<f32>),
    /// Row-major `[batch, heads]` slopes.
    PerBatchHead {
        batch: usize,
        heads: usize,
        values: Vec<f32>,
    },
}

impl AlibiSlopes {
    /// The standard geometric schedule `2^(-8h/H)` for `h = 1..=H`.
    pub fn geometric(num_heads: usize) -> Self {
        let heads = num_heads.max(1) as f32;
        let slopes = (1..=num_heads)
            .map(|h| 2f32.powf(-8.0 * h as f32 / heads))
            .collect();
        Self::PerHead(slopes)
    }

    pub fn num_heads(&self) -> usize {
        match self {
            Self::PerHead(values) => values.len(),
            Self::PerBatchHead { heads, .. } => *heads,
        }
    }

    fn values(&self) -> &[f32] {
        match self {
            Self::PerHead(values) => values,
            Self::PerBatchHead { values, .. } => values,
        }
    }

    /// Checks the slope count against the layer's head count.
    pub fn validate(&self, num_heads: usize) -> Result<()> {
        if let Self::PerBatchHead {
            batch,
            heads,
            values,
        } = self
        {
            if values.len() != batch * heads {
                return Err(AttentionError::configuration(format!(
                    "per-(batch, head) alibi slopes hold {} values, expected {batch}x{heads}",
                    values.len()
                )));
            }
        }
        if self.num_heads() != num_heads {
            return Err(AttentionError::configuration(format!(
                "alibi slopes cover {} heads but the layer has {num_heads}",
                self.num_heads()
            )));
        }
        if self.values().iter().any(|s| !s.is_finite()) {
            return Err(AttentionError::configuration(
                "alibi slopes must be finite",
            ));
        }
        Ok(())
    }

    /// Slopes laid out as `[1 | batch, heads, 1, 1]` in `f32`, ready to
    /// broadcast over a `[batch, heads, q_len, k_len]` logit block.
    pub fn to_tensor(&self, batch: usize, heads: usize, device: &Device) -> Result<Tensor> {
        match self {
            Self::PerHead(values) => {
                if values.len() != heads {
                    return Err(AttentionError::shape(format!(
                        "alibi slopes cover {} heads, q has {heads}",
                        values.len()
                    )));
                }
                Ok(Tensor::from_slice(values, (1, heads, 1, 1), device)?)
            }
            Self::PerBatchHead {
                batch: slope_batch,
                heads: slope_heads,
                values,
            } => {
                if *slope_batch != batch || *slope_heads != heads || values.len() != batch * heads
                {
                    return Err(AttentionError::shape(format!(
                        "alibi slopes shaped [{slope_batch}, {slope_heads}], expected [{batch}, {heads}]"
                    )));
                }
                Ok(Tensor::from_slice(values, (batch, heads, 1, 1), device)?)
            }
        }
    }

    fn summary(&self) -> String {
        match self {
            Self::PerHead(values) => format!("per-head[{}]", values.len()),
            Self::PerBatchHead { batch, heads, .. } => format!("per-batch-head[{batch}x{heads}]"),
        }
    }
}

/// Immutable masking, bias and scaling policy applied by a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionPolicy {
    pub causal: bool,
    pub window: WindowSize,
    pub alibi_slopes: Option<AlibiSlopes>,
    /// Constant added to every logit before the sigmoid.
    pub sigmoid_bias: f32,
    /// Dropout on the attention weights during training.
    pub attn_dropout_p: f32,
    /// Split the `d^-0.5` scale evenly across q and k before the dot product.
    pub prescale: bool,
}

impl Default for AttentionPolicy {
    fn default() -> Self {
        Self {
            causal: false,
            window: WindowSize::UNBOUNDED,
            alibi_slopes: None,
            sigmoid_bias: 0.0,
            attn_dropout_p: 0.0,
            prescale: true,
        }
    }
}

impl AttentionPolicy {
    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_window(mut self, window: WindowSize) -> Self {
        self.window = window;
        self
    }

    pub fn with_alibi(mut self, slopes: AlibiSlopes) -> Self {
        self.alibi_slopes = Some(slopes);
        self
    }

    pub fn with_sigmoid_bias(mut self, bias: f32) -> Self {
        self.sigmoid_bias = bias;
        self
    }

    pub fn with_attn_dropout(mut self, p: f32) -> Self {
        self.attn_dropout_p = p;
        self
    }

    pub fn with_prescale(mut self, prescale: bool) -> Self {
        self.prescale = prescale;
        self
    }

    /// Construction-time checks against the layer's head count.
    pub fn validate(&self, num_heads: usize) -> Result<()> {
        if !(0.0..1.0).contains(&self.attn_dropout_p) {
            return Err(AttentionError::configuration(format!(
                "attention dropout must be in [0, 1), got {}",
                self.attn_dropout_p
            )));
        }
        if !self.sigmoid_bias.is_finite() {
            return Err(AttentionError::configuration(format!(
                "sigmoid bias must be finite, got {}",
                self.sigmoid_bias
            )));
        }
        self.window.validate()?;
        if let Some(slopes) = &self.alibi_slopes {
            slopes.validate(num_heads)?;
        }
        Ok(())
    }
}

impl fmt::Display for AttentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alibi = self
            .alibi_slopes
            .as_ref()
            .map(AlibiSlopes::summary)
            .unwrap_or_else(|| "none".to_string());
        write!(
            f,
            "causal={}, window={}, alibi={}, sigmoid_bias={}, attn_drop={}, prescale={}",
            self.causal, self.window, alibi, self.sigmoid_bias, self.attn_dropout_p, self.prescale
        )
    }
}

/// Which kernel implementation a layer dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelBackend {
    /// Materialises the full logit matrix.
    Reference,
    /// Key-tiled kernel; requires the `fused` feature.
    Fused,
    /// Tiled kernel when compiled in, reference otherwise.
    FusedOrReference,
}

impl KernelBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Fused => "fused",
            Self::FusedOrReference => "fused-or-reference",
        }
    }

    /// Applies the [`BACKEND_ENV_VAR`] override, if one is set.
    pub fn apply_env_overrides(self) -> Self {
        self.with_override(std::env::var(BACKEND_ENV_VAR).ok().as_deref())
    }

    pub(crate) fn with_override(self, value: Option<&str>) -> Self {
        match value {
            Some(raw) => match raw.parse() {
                Ok(backend) => backend,
                Err(err) => {
                    log::warn!("ignoring {BACKEND_ENV_VAR}: {err}");
                    self
                }
            },
            None => self,
        }
    }
}

impl Default for KernelBackend {
    fn default() -> Self {
        DEFAULT_KERNEL_BACKEND
    }
}

impl fmt::Display for KernelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelBackend {
    type Err = AttentionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" | "exact" => Ok(Self::Reference),
            "fused" | "tiled" => Ok(Self::Fused),
            "fused-or-reference" | "auto" => Ok(Self::FusedOrReference),
            other => Err(AttentionError::configuration(format!(
                "unknown kernel backend `{other}`"
            ))),
        }
    }
}

/// Kernel entry point used by the self-attention layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallShape {
    /// Separate q, k, v tensors.
    #[default]
    Unpacked,
    /// A single `[batch, seq, 3, heads, head_dim]` tensor.
    Packed,
}
