//! Additive logit biases shared by the sigmoid kernels.
//!
//! Masks are `f32` tensors holding `0.0` (keep) or `f32::NEG_INFINITY`
//! (discard); since `sigmoid(-inf) == 0`, a discarded pair contributes exactly
//! nothing. All builders work on a contiguous range of key columns so tiled
//! kernels can request one block at a time.

pub mod alibi;
pub mod causal;
pub mod window;

use std::ops::Range;

use candle_core::{DType, Device, Tensor};

use crate::core::{AlibiSlopes, Result, WindowSize};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use alibi::{alibi_bias, alibi_distances};
pub use causal::build_causal_mask;
pub use window::build_window_mask;

/// Which query/key pairs survive causal and window masking.
///
/// Query row `i` is aligned with key `i + offset`, where
/// `offset = k_len - q_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskGeometry {
    pub q_len: usize,
    pub k_len: usize,
    pub causal: bool,
    pub window: WindowSize,
}

impl MaskGeometry {
    pub fn new(q_len: usize, k_len: usize, causal: bool, window: WindowSize) -> Self {
        Self {
            q_len,
            k_len,
            causal,
            window,
        }
    }

    pub fn offset(&self) -> i64 {
        self.k_len as i64 - self.q_len as i64
    }

    /// Whether any pair can be masked at all.
    pub fn is_masking(&self) -> bool {
        self.causal || !self.window.is_unbounded()
    }

    /// Inclusive range of visible keys for `row`; empty when `lo > hi`.
    pub fn visible_keys(&self, row: usize) -> (i64, i64) {
        let diagonal = row as i64 + self.offset();
        let mut lo = 0i64;
        let mut hi = self.k_len as i64 - 1;
        if !self.window.is_unbounded_left() {
            lo = lo.max(diagonal - self.window.left);
        }
        if !self.window.is_unbounded_right() {
            hi = hi.min(diagonal + self.window.right);
        }
        if self.causal {
            hi = hi.min(causal::causal_limit(row, self.offset()));
        }
        (lo, hi)
    }

    pub fn is_visible(&self, row: usize, key: usize) -> bool {
        let (lo, hi) = self.visible_keys(row);
        let key = key as i64;
        lo <= key && key <= hi
    }

    /// True when no query row can see any key in `keys`.
    pub fn block_is_masked(&self, keys: &Range<usize>) -> bool {
        (0..self.q_len).all(|row| {
            let (lo, hi) = self.visible_keys(row);
            lo > hi || hi < keys.start as i64 || lo >= keys.end as i64
        })
    }

    /// Additive mask `[1, 1, q_len, keys.len()]` for the given key columns.
    pub fn mask(&self, keys: Range<usize>, device: &Device) -> Result<Tensor> {
        let width = keys.len();
        let mut data = vec![0f32; self.q_len * width];
        for row in 0..self.q_len {
            let row_start = row * width;
            for (col, key) in keys.clone().enumerate() {
                if !self.is_visible(row, key) {
                    data[row_start + col] = f32::NEG_INFINITY;
                }
            }
        }
        Ok(Tensor::from_vec(data, (1, 1, self.q_len, width), device)?)
    }
}

/// Mask and ALiBi terms for one block of key columns.
#[derive(Debug, Clone)]
pub struct LogitBias {
    mask: Option<Tensor>,
    alibi: Option<Tensor>,
}

impl LogitBias {
    pub fn build(
        geometry: &MaskGeometry,
        slopes: Option<&AlibiSlopes>,
        batch: usize,
        heads: usize,
        keys: Range<usize>,
        device: &Device,
    ) -> Result<Self> {
        let mask = if geometry.is_masking() {
            Some(geometry.mask(keys.clone(), device)?)
        } else {
            None
        };
        let alibi = match slopes {
            Some(slopes) => Some(alibi_bias(
                slopes,
                batch,
                heads,
                geometry.q_len,
                geometry.k_len,
                keys,
                device,
            )?),
            None => None,
        };
        Ok(Self { mask, alibi })
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_none() && self.alibi.is_none()
    }

    /// Adds the bias terms to `[batch, heads, q_len, keys]` logits.
    pub fn apply(&self, logits: &Tensor) -> Result<Tensor> {
        let mut out = logits.clone();
        if let Some(alibi) = &self.alibi {
            out = out.broadcast_add(alibi)?;
        }
        if let Some(mask) = &self.mask {
            out = out.broadcast_add(mask)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests;
