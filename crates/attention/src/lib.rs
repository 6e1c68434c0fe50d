//! Multi-head attention layers weighted by an independent sigmoid per
//! query/key pair.
//!
//! Inputs `Q`, `K`, and `V` use the layout `[batch, seq_len, heads, head_dim]`
//! (or packed `[batch, seq_len, 3, heads, head_dim]`) in bf16, f16, or f32.
//! Each logit `q_i . k_j * scale + alibi(i, j) + sigmoid_bias` passes through
//! its own sigmoid; weights are never normalised across keys. Reductions run
//! in `f32` and outputs come back in the dtype of `V`.
//!
//! Causal and sliding-window masks align the last query with the last key, so
//! queries shorter than keys see the whole prefix. ALiBi penalties use the same
//! alignment.
//!
//! Dropout on the weights and on the projected output is a training-only
//! concern; use `forward_t(.., false)` for deterministic evaluation.

pub mod backend;
pub mod components;
pub mod core;
pub mod cross_attention;
pub mod functional;
pub mod interop;
pub mod masks;
pub mod reference;
pub mod self_attention;

#[cfg(feature = "fused")]
pub mod fused;

pub use backend::{fused_available, select_kernel};
pub use components::{AttentionComponents, AttentionOutput};
pub use crate::core::{
    AlibiSlopes, AttentionError, AttentionKernel, AttentionPolicy, CallShape, KernelArgs,
    KernelBackend, PositionalTransform, WindowSize, DEFAULT_KERNEL_BACKEND,
};
pub use cross_attention::{CrossAttentionConfig, SigmoidCrossAttention};
pub use functional::{packed_sigmoid_attention, sigmoid_attention};
pub use interop::RotaryTransform;
pub use reference::ExactSigmoidAttention;
pub use self_attention::{SelfAttentionConfig, SigmoidSelfAttention};

#[cfg(feature = "fused")]
pub use fused::TiledSigmoidAttention;
