//! ALiBi linear distance penalties.

use std::ops::Range;

use candle_core::{Device, Tensor};

use crate::core::{AlibiSlopes, Result};

/// `|i + k_len - q_len - j|` for every row and the given key columns, shaped
/// `[1, 1, q_len, keys.len()]`.
pub fn alibi_distances(
    q_len: usize,
    k_len: usize,
    keys: Range<usize>,
    device: &Device,
) -> Result<Tensor> {
    let offset = k_len as i64 - q_len as i64;
    let width = keys.len();
    let mut data = Vec::with_capacity(q_len * width);
    for row in 0..q_len {
        let diagonal = row as i64 + offset;
        data.extend(keys.clone().map(|key| (diagonal - key as i64).abs() as f32));
    }
    Ok(Tensor::from_vec(data, (1, 1, q_len, width), device)?)
}

/// `-slope * distance`, shaped `[1 | batch, heads, q_len, keys.len()]`.
pub fn alibi_bias(
    slopes: &AlibiSlopes,
    batch: usize,
    heads: usize,
    q_len: usize,
    k_len: usize,
    keys: Range<usize>,
    device: &Device,
) -> Result<Tensor> {
    let slopes = slopes.to_tensor(batch, heads, device)?;
    let distances = alibi_distances(q_len, k_len, keys, device)?;
    Ok(slopes.broadcast_mul(&distances)?.neg()?)
}
