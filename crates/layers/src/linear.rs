//! Linear and affine projection helpers.
//!
//! Linear layers map `(..., in_dim)` to `(..., out_dim)`; every leading axis is
//! folded into the row dimension of a single matmul. Multi-projection variants
//! pack the output as `(..., fused_projections * output_dim)` so that callers
//! can reshape and split them (the fused QKV projection of self-attention, the
//! fused KV projection of cross-attention). Weights and activations are cast to
//! [`PrecisionPolicy::compute`] for the matmul and the result is cast back with
//! [`PrecisionPolicy::cast_to_storage`].
//!
//! Attention layers never construct [`Linear`] directly; they ask a
//! [`LinearFactory`] so quantised or otherwise custom projections can be
//! injected without touching the layer code.

use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            fused_projections: 1,
        }
    }

    /// Sets whether a bias vector is learned.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Packs `count` projections of `output_dim` features into one matmul.
    pub fn fused(mut self, count: usize) -> Self {
        self.fused_projections = count;
        self
    }

    /// Indicates whether outputs are packed for multi-way projections.
    pub fn is_fused(&self) -> bool {
        self.fused_projections > 1
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync + fmt::Debug {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the linear projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Builds projection layers on behalf of attention modules.
pub trait LinearFactory: Send + Sync + fmt::Debug {
    /// Creates a projection described by `config` on `device` with parameters in `dtype`.
    fn build(
        &self,
        config: LinearConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Arc<dyn LinearLayer>>;
}

/// Supported weight initialisation policies for transformer projections.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation (defaults to ReLU gain).
    KaimingUniform { negative_slope: f64 },
    /// Scales another policy to support deep network stabilisation.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight_f32 = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64).sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::Scaled { base, scale } => {
                base.sample(shape, device, DType::F32)?.affine(*scale, 0.0)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight_f32)
        } else {
            checks::ensure_cast_supported("linear.init", DType::F32, dtype)?;
            weight_f32.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// `weight` is laid out `(total_output_dim, input_dim)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.total_output_dim(), config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.total_output_dim(), dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        checks::expect_contiguous("linear.weight", weight)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
                checks::expect_dtype_in(
                    "linear.bias",
                    tensor,
                    &[DType::F16, DType::BF16, DType::F32],
                )?;
                checks::expect_contiguous("linear.bias", tensor)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        if hidden.rank() < 2 {
            return Err(Error::Msg(format!(
                "linear expects input shaped [..., {}], got {:?}",
                self.config.input_dim,
                hidden.dims()
            )));
        }
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        if hidden.dims().iter().any(|&d| d == 0) {
            return Err(Error::Msg("linear input dimensions must be non-zero".into()));
        }
        Ok(())
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let dims = hidden.dims();
        let rows: usize = dims[..dims.len() - 1].iter().product();
        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.config.total_output_dim());

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;
        let flat = input.reshape((rows, self.config.input_dim))?;
        let mut output = flat.matmul(&weight_t)?;

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output.reshape(out_dims)?)
    }
}

/// Default factory producing randomly initialised [`Linear`] layers.
#[derive(Debug, Clone)]
pub struct DenseLinearFactory {
    pub init: LinearInit,
}

impl Default for DenseLinearFactory {
    fn default() -> Self {
        Self {
            init: LinearInit::XavierUniform,
        }
    }
}

impl LinearFactory for DenseLinearFactory {
    fn build(
        &self,
        config: LinearConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Arc<dyn LinearLayer>> {
        log::debug!(
            "linear factory: {} -> {} x{} (bias={}, dtype={:?})",
            config.input_dim,
            config.output_dim,
            config.fused_projections,
            config.bias,
            dtype
        );
        Ok(Arc::new(Linear::with_init(config, &self.init, device, dtype)?))
    }
}
