//! Building blocks consumed by the attention layers.
//!
//! The crate hosts the linear projection, per-head normalisation and dropout
//! primitives together with the dtype policy that governs how they cast
//! activations. Every primitive sits behind a small trait (or factory trait)
//! so attention layers can swap implementations at construction time.

pub mod checks;
pub mod dropout;
pub mod dtypes;
pub mod linear;
pub mod norm;

pub use dropout::Dropout;
pub use dtypes::PrecisionPolicy;
pub use linear::{DenseLinearFactory, Linear, LinearConfig, LinearFactory, LinearInit, LinearLayer};
pub use norm::{
    IdentityNorm, LayerNorm, NormConfig, NormFactory, NormKind, NormalizationLayer, RmsNorm,
};
