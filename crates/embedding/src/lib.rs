//! Positional embedding crate.
//!
//! Hosts the rotary positional embedding (RoPE) used to inject relative
//! position information into attention queries and keys.

pub mod positional;

pub use positional::rope::{Rope, RopeConfig};
