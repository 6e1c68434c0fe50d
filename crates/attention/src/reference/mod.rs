//! Portable, exact implementation of sigmoid attention.
//!
//! This path favours clarity over absolute performance and serves as the
//! baseline for validating the tiled kernel.

pub mod exact;

pub use exact::ExactSigmoidAttention;
