//! Normalisation layers bundled with unified shape and dtype handling.
//!
//! Normalisation happens along the last axis of inputs of any rank, so the
//! same layer serves `(batch, seq, hidden)` activations and per-head
//! `(batch, seq, heads, head_dim)` query/key/value slices. Statistics (mean,
//! variance) are promoted to [`PrecisionPolicy::reduction`] before the result
//! is cast back to the storage dtype.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Error, Result, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::{checks, dtypes::PrecisionPolicy};

/// Available normalisation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NormKind {
    /// Standard LayerNorm with learnable affine parameters.
    #[default]
    LayerNorm,
    /// RMSNorm variant that matches LLaMA style blocks.
    RmsNorm,
}

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the trailing dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser applied to variance or RMS computations.
    pub epsilon: f64,
    /// Desired variant of the normalisation routine.
    pub kind: NormKind,
    /// Whether post-normalisation affine parameters are present.
    pub elementwise_affine: bool,
}

impl NormConfig {
    /// Creates a configuration using defaults aligned with transformer blocks.
    pub fn new(hidden_size: usize, kind: NormKind) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            kind,
            elementwise_affine: true,
        }
    }
}

/// Shared interface for normalisation layers.
pub trait NormalizationLayer: Send + Sync + fmt::Debug {
    /// Size of the trailing dimension this layer accepts.
    fn hidden_size(&self) -> usize;

    /// Applies the normalisation along the trailing dimension.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Builds normalisation layers on behalf of attention modules.
pub trait NormFactory: Send + Sync + fmt::Debug {
    /// Creates a layer normalising a trailing dimension of `hidden_size`.
    fn build(
        &self,
        hidden_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Arc<dyn NormalizationLayer>>;
}

#[derive(Debug, Clone)]
struct NormImpl {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl NormImpl {
    fn new(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self> {
        if matches!(config.kind, NormKind::RmsNorm) && bias.is_some() {
            return Err(Error::Msg("RMSNorm does not support bias parameters".into()));
        }
        if config.elementwise_affine {
            if weight.is_none() {
                return Err(Error::Msg(
                    "elementwise affine norms must supply a scale parameter".into(),
                ));
            }
        } else if weight.is_some() || bias.is_some() {
            return Err(Error::Msg(
                "non-affine norms must not include scale or bias parameters".into(),
            ));
        }

        for (label, param) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            if let Some(param) = param {
                checks::expect_shape(label, param, &[config.hidden_size])?;
                checks::expect_dtype_in(label, param, &[DType::F16, DType::BF16, DType::F32])?;
                checks::expect_contiguous(label, param)?;
            }
        }

        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let mut compute = policy.cast_for_reduction(hidden)?;

        if matches!(self.config.kind, NormKind::LayerNorm) {
            let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
            compute = compute.broadcast_sub(&mean)?;
        }

        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_div(&denom)?;

        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }
        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.to_dtype(normalized.dtype())?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(normalized.dtype())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}

/// Standard LayerNorm implementation with optional affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: NormImpl,
}

impl LayerNorm {
    /// Constructs a LayerNorm with learnable scale and bias parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::LayerNorm;
        config.elementwise_affine = true;
        Ok(Self {
            inner: NormImpl::new(config, Some(weight), Some(bias))?,
        })
    }

    /// Constructs a LayerNorm without affine parameters (scale = 1, bias = 0).
    pub fn without_affine(mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::LayerNorm;
        config.elementwise_affine = false;
        Ok(Self {
            inner: NormImpl::new(config, None, None)?,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn hidden_size(&self) -> usize {
        self.inner.config.hidden_size
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }
}

/// Root mean square norm that mirrors LLaMA-style transformer blocks.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: NormImpl,
}

impl RmsNorm {
    /// Constructs a RMSNorm with learnable scale.
    pub fn new(weight: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        config.elementwise_affine = true;
        Ok(Self {
            inner: NormImpl::new(config, Some(weight), None)?,
        })
    }

    /// Constructs a RMSNorm without affine parameters (pure normalization).
    pub fn without_scale(mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        config.elementwise_affine = false;
        Ok(Self {
            inner: NormImpl::new(config, None, None)?,
        })
    }
}

impl NormalizationLayer for RmsNorm {
    fn hidden_size(&self) -> usize {
        self.inner.config.hidden_size
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }
}

/// Pass-through used wherever a policy disables normalisation.
#[derive(Debug, Clone, Copy)]
pub struct IdentityNorm {
    hidden_size: usize,
}

impl IdentityNorm {
    pub fn new(hidden_size: usize) -> Self {
        Self { hidden_size }
    }
}

impl NormalizationLayer for IdentityNorm {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn forward(&self, hidden: &Tensor, _policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("identity_norm.input", hidden, self.hidden_size)?;
        Ok(hidden.clone())
    }
}

/// Builds freshly initialised layers of the selected kind (unit scale, zero bias).
impl NormFactory for NormKind {
    fn build(
        &self,
        hidden_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Arc<dyn NormalizationLayer>> {
        let config = NormConfig::new(hidden_size, *self);
        let weight = Tensor::ones(hidden_size, dtype, device)?;
        match self {
            NormKind::LayerNorm => {
                let bias = Tensor::zeros(hidden_size, dtype, device)?;
                Ok(Arc::new(LayerNorm::new(weight, bias, config)?))
            }
            NormKind::RmsNorm => Ok(Arc::new(RmsNorm::new(weight, config)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtypes::PrecisionPolicy;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::ops;

    fn build_input(device: &Device, dtype: DType, dims: &[usize]) -> Result<Tensor> {
        let total: usize = dims.iter().product();
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, dims, device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 4;
        let config = NormConfig::new(hidden, NormKind::LayerNorm);
        let weight_f32 = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (hidden,), &device)?;
        let bias_f32 = Tensor::from_vec(vec![0.1f32, -0.2, 0.05, 0.0], (hidden,), &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, &[2, 3, hidden])?;
            let weight = weight_f32.to_dtype(dtype)?;
            let bias = bias_f32.to_dtype(dtype)?;
            let layer = LayerNorm::new(weight.clone(), bias.clone(), config.clone())?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = layer.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::layer_norm(&input, &weight, &bias, config.epsilon as f32)?;
            let tol = match dtype {
                DType::F16 => 1e-3,
                DType::BF16 => 1e-2,
                _ => 5e-4,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {} for dtype {:?}", diff, dtype);
        }
        Ok(())
    }

    #[test]
    fn per_head_layer_norm_normalises_each_head_independently() -> Result<()> {
        let device = Device::Cpu;
        let (batch, seq, heads, head_dim) = (2, 3, 4, 8);
        let input = build_input(&device, DType::F32, &[batch, seq, heads, head_dim])?;
        let layer = NormKind::LayerNorm.build(head_dim, &device, DType::F32)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = layer.forward(&input, &policy)?;
        assert_eq!(output.dims(), &[batch, seq, heads, head_dim]);

        let flat = input.reshape((batch * seq * heads, head_dim))?;
        let weight = Tensor::ones(head_dim, DType::F32, &device)?;
        let bias = Tensor::zeros(head_dim, DType::F32, &device)?;
        let reference = ops::layer_norm(&flat, &weight, &bias, 1e-5)?
            .reshape((batch, seq, heads, head_dim))?;
        assert!(max_diff(&output, &reference)? < 5e-4);
        Ok(())
    }

    #[test]
    fn rms_norm_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 6;
        let mut config = NormConfig::new(hidden, NormKind::RmsNorm);
        config.epsilon = 1e-6;
        let weight_f32 = Tensor::from_vec(
            (0..hidden)
                .map(|i| 1.0_f32 + (i as f32) * 0.01)
                .collect::<Vec<_>>(),
            (hidden,),
            &device,
        )?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, &[2, 4, hidden])?;
            let weight = weight_f32.to_dtype(dtype)?;
            let norm = RmsNorm::new(weight.clone(), config.clone())?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = norm.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::rms_norm(&input, &weight, config.epsilon as f32)?;
            let tol = match dtype {
                DType::F16 => 1e-3,
                DType::BF16 => 1e-2,
                _ => 5e-4,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {} for dtype {:?}", diff, dtype);
        }
        Ok(())
    }

    #[test]
    fn non_affine_variants_match_unit_parameters() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 3;
        let input = build_input(&device, DType::F32, &[1, 5, hidden])?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let ones = Tensor::ones((hidden,), DType::F32, &device)?;
        let zeros = Tensor::zeros((hidden,), DType::F32, &device)?;

        let layer = LayerNorm::without_affine(NormConfig::new(hidden, NormKind::LayerNorm))?;
        let reference = ops::layer_norm(&input, &ones, &zeros, 1e-5)?;
        assert!(max_diff(&layer.forward(&input, &policy)?, &reference)? < 5e-4);

        let mut rms_config = NormConfig::new(hidden, NormKind::RmsNorm);
        rms_config.epsilon = 1e-6;
        let rms = RmsNorm::without_scale(rms_config)?;
        let reference = ops::rms_norm(&input, &ones, 1e-6)?;
        assert!(max_diff(&rms.forward(&input, &policy)?, &reference)? < 5e-4);
        Ok(())
    }

    #[test]
    fn rms_norm_rejects_bias() -> Result<()> {
        let device = Device::Cpu;
        let config = NormConfig::new(4, NormKind::RmsNorm);
        let weight = Tensor::ones(4, DType::F32, &device)?;
        let bias = Tensor::zeros(4, DType::F32, &device)?;
        assert!(NormImpl::new(config, Some(weight), Some(bias)).is_err());
        Ok(())
    }

    #[test]
    fn identity_norm_is_passthrough_but_checks_width() -> Result<()> {
        let device = Device::Cpu;
        let input = build_input(&device, DType::F32, &[1, 2, 2, 4])?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let identity = IdentityNorm::new(4);
        assert_eq!(max_diff(&identity.forward(&input, &policy)?, &input)?, 0.0);
        assert!(IdentityNorm::new(5).forward(&input, &policy).is_err());
        Ok(())
    }

    #[test]
    fn gradient_check_layer_norm_sum_output() -> Result<()> {
        let device = Device::Cpu;
        let (batch, seq, hidden) = (1, 2, 3);
        let total = batch * seq * hidden;
        let config = NormConfig::new(hidden, NormKind::LayerNorm);
        let layer = LayerNorm::without_affine(config.clone())?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let weight = Tensor::ones((hidden,), DType::F32, &device)?;
        let bias = Tensor::zeros((hidden,), DType::F32, &device)?;

        let base = (0..total)
            .map(|i| (i as f32) * 0.1 - 0.2)
            .collect::<Vec<_>>();

        let eval_layer = |values: &[f32]| -> Result<f32> {
            let tensor = Tensor::from_vec(values.to_vec(), (batch, seq, hidden), &device)?;
            layer.forward(&tensor, &policy)?.sum_all()?.to_vec0::<f32>()
        };
        let eval_reference = |values: &[f32]| -> Result<f32> {
            let tensor = Tensor::from_vec(values.to_vec(), (batch, seq, hidden), &device)?;
            ops::layer_norm(&tensor, &weight, &bias, config.epsilon as f32)?
                .sum_all()?
                .to_vec0::<f32>()
        };

        let eps = 1e-3f32;
        for idx in 0..total {
            let mut plus = base.clone();
            plus[idx] += eps;
            let mut minus = base.clone();
            minus[idx] -= eps;
            let ours = (eval_layer(&plus)? - eval_layer(&minus)?) / (2.0 * eps);
            let reference = (eval_reference(&plus)? - eval_reference(&minus)?) / (2.0 * eps);
            assert!(
                (ours - reference).abs() < 1e-3,
                "grad mismatch at {}: {} vs {}",
                idx,
                ours,
                reference
            );
        }
        Ok(())
    }
}
