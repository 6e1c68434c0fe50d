//! Interoperability helpers bridging attention with upstream components.

pub mod rope_adapter;

pub use rope_adapter::RotaryTransform;
