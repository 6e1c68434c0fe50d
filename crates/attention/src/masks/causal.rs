//! Causal masks aligned to the end of the key sequence.

use candle_core::{Device, Tensor};

use super::MaskGeometry;
use crate::core::{Result, WindowSize};

/// Last key index visible from `row` under causal masking.
pub fn causal_limit(row: usize, offset: i64) -> i64 {
    row as i64 + offset
}

/// Construct a causal mask shaped `[1, 1, q_len, k_len]`.
///
/// When `k_len > q_len`, queries align with the most recent `q_len` keys and
/// see the whole prefix; when `k_len < q_len` the earliest rows see nothing.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    MaskGeometry::new(q_len, k_len, true, WindowSize::UNBOUNDED).mask(0..k_len, device)
}
