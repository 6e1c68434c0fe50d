//! Kernel selection.

use std::sync::Arc;

use crate::core::{AttentionError, AttentionKernel, KernelBackend, Result};
use crate::reference::ExactSigmoidAttention;

/// Whether the tiled kernel was compiled into this build.
pub fn fused_available() -> bool {
    cfg!(feature = "fused")
}

/// Builds the kernel for `backend`.
///
/// `Fused` fails with [`AttentionError::BackendUnavailable`] when the `fused`
/// feature is off; `FusedOrReference` falls back to the reference kernel.
pub fn select_kernel(backend: KernelBackend) -> Result<Arc<dyn AttentionKernel>> {
    let kernel: Arc<dyn AttentionKernel> = match backend {
        KernelBackend::Reference => Arc::new(ExactSigmoidAttention::new()),
        KernelBackend::Fused => fused_kernel()
            .ok_or(AttentionError::BackendUnavailable { backend: "fused" })?,
        KernelBackend::FusedOrReference => match fused_kernel() {
            Some(kernel) => kernel,
            None => {
                log::debug!("fused attention kernel not compiled in, using reference");
                Arc::new(ExactSigmoidAttention::new())
            }
        },
    };
    log::debug!("selected {} kernel for backend {backend}", kernel.name());
    Ok(kernel)
}

#[cfg(feature = "fused")]
fn fused_kernel() -> Option<Arc<dyn AttentionKernel>> {
    Some(Arc::new(crate::fused::TiledSigmoidAttention::default()))
}

#[cfg(not(feature = "fused"))]
fn fused_kernel() -> Option<Arc<dyn AttentionKernel>> {
    None
}
