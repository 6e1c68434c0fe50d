//! Sliding-window masks.
//!
//! Key `j` is hidden from row `i` when `left >= 0 && j < i + offset - left`
//! or `right >= 0 && j > i + offset + right`.

use candle_core::{Device, Tensor};

use super::MaskGeometry;
use crate::core::{Result, WindowSize};

/// Construct a non-causal window mask shaped `[1, 1, q_len, k_len]`.
pub fn build_window_mask(
    device: &Device,
    q_len: usize,
    k_len: usize,
    window: WindowSize,
) -> Result<Tensor> {
    window.validate()?;
    MaskGeometry::new(q_len, k_len, false, window).mask(0..k_len, device)
}
