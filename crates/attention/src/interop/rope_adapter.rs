//! Rotary positional transform backed by the embedding crate.
//!
//! Queries and keys are laid out as `[batch, seq_len, heads, head_dim]` and
//! rotated independently, so their sequence lengths may differ. Sine/cosine
//! tables come from the embedding crate's shared LRU cache.

use candle_core::Tensor;
use embedding::{Rope, RopeConfig};

use crate::core::{AttentionError, PositionalTransform, Result};

/// [`PositionalTransform`] applying rotary embeddings to q and k.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryTransform {
    rope: Rope,
}

impl RotaryTransform {
    /// Validates the rotary geometry up front.
    pub fn new(config: RopeConfig) -> Result<Self> {
        let rope = Rope::new(config)
            .map_err(|err| AttentionError::configuration(format!("rotary embedding: {err}")))?;
        Ok(Self { rope })
    }

    /// Full-width rotation with the default base angle.
    pub fn for_head_dim(head_dim: usize) -> Result<Self> {
        Self::new(RopeConfig::new(head_dim))
    }

    pub fn config(&self) -> &RopeConfig {
        self.rope.config()
    }
}

impl PositionalTransform for RotaryTransform {
    fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        q_pos_offset: usize,
        k_pos_offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        let head_dim = self.rope.config().head_dim;
        for (label, tensor) in [("q", q), ("k", k)] {
            if tensor.rank() != 4 || tensor.dims()[3] != head_dim {
                return Err(AttentionError::shape(format!(
                    "rotary transform expects {label} shaped [batch, seq, heads, {head_dim}], got {:?}",
                    tensor.dims()
                )));
            }
        }
        Ok(self.rope.rotate_qk(q, k, q_pos_offset, k_pos_offset)?)
    }

    fn describe(&self) -> String {
        format!("rope({})", self.rope.config().fingerprint())
    }
}
