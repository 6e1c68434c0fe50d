//! Pluggable pieces injected into the attention layers at construction.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use layers::{
    DenseLinearFactory, IdentityNorm, LinearFactory, NormFactory, NormKind, NormalizationLayer,
};

use crate::backend::select_kernel;
use crate::core::{AttentionError, AttentionKernel, KernelBackend, PositionalTransform, Result};

/// Strategy objects a layer is assembled from.
///
/// Unset slots fall back to the layer config: the norm kind it names and the
/// kernel its backend selects.
#[derive(Debug, Clone)]
pub struct AttentionComponents {
    pub linear: Arc<dyn LinearFactory>,
    pub norm: Option<Arc<dyn NormFactory>>,
    pub kernel: Option<Arc<dyn AttentionKernel>>,
    pub positional: Option<Arc<dyn PositionalTransform>>,
}

impl Default for AttentionComponents {
    fn default() -> Self {
        Self {
            linear: Arc::new(DenseLinearFactory::default()),
            norm: None,
            kernel: None,
            positional: None,
        }
    }
}

impl AttentionComponents {
    pub fn with_linear(mut self, factory: Arc<dyn LinearFactory>) -> Self {
        self.linear = factory;
        self
    }

    pub fn with_norm(mut self, factory: Arc<dyn NormFactory>) -> Self {
        self.norm = Some(factory);
        self
    }

    pub fn with_kernel(mut self, kernel: Arc<dyn AttentionKernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn with_positional(mut self, transform: Arc<dyn PositionalTransform>) -> Self {
        self.positional = Some(transform);
        self
    }

    /// The injected kernel, or the one the (env-overridable) backend selects.
    pub(crate) fn resolve_kernel(&self, backend: KernelBackend) -> Result<Arc<dyn AttentionKernel>> {
        match &self.kernel {
            Some(kernel) => Ok(Arc::clone(kernel)),
            None => select_kernel(backend.apply_env_overrides()),
        }
    }

    /// A per-head norm over `hidden_size`, or identity when `enabled` is off.
    pub(crate) fn build_norm(
        &self,
        enabled: bool,
        kind: NormKind,
        hidden_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Arc<dyn NormalizationLayer>> {
        if !enabled {
            return Ok(Arc::new(IdentityNorm::new(hidden_size)));
        }
        let built = match &self.norm {
            Some(factory) => factory.build(hidden_size, device, dtype),
            None => kind.build(hidden_size, device, dtype),
        };
        built.map_err(|err| AttentionError::configuration(format!("norm layer: {err}")))
    }
}

/// Result of one layer call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Kernel output flattened over heads, before the output projection.
    pub attn_times_v: Tensor,
    /// Projected output after dropout.
    pub attn_proj: Tensor,
}

pub(crate) fn describe_transform(transform: &Option<Arc<dyn PositionalTransform>>) -> String {
    transform
        .as_ref()
        .map(|t| t.describe())
        .unwrap_or_else(|| "none".to_string())
}
