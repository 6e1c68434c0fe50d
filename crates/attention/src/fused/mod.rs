//! Key-tiled sigmoid attention.
//!
//! Because sigmoid weights are independent per key, the output is a plain sum
//! over key blocks with no running max or rescaling. Blocks that causal or
//! window masking hides from every query row are skipped outright. Only
//! compiled with the `fused` feature.

use std::ops::Range;
use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::sigmoid;

use crate::core::{validate_qkv, AttentionError, AttentionKernel, KernelArgs, Result};
use crate::masks::{LogitBias, MaskGeometry};
use crate::reference::exact::{heads_first, restore_layout, weight_dropout};

/// Key block width used by [`TiledSigmoidAttention::default`].
pub const DEFAULT_KEY_BLOCK: usize = 64;

/// Streams key/value blocks and accumulates weighted values.
#[derive(Debug)]
pub struct TiledSigmoidAttention {
    key_block: usize,
    first_call: OnceLock<()>,
}

impl TiledSigmoidAttention {
    pub fn new(key_block: usize) -> Result<Self> {
        if key_block == 0 {
            return Err(AttentionError::configuration(
                "key block width must be non-zero",
            ));
        }
        Ok(Self {
            key_block,
            first_call: OnceLock::new(),
        })
    }

    pub fn key_block(&self) -> usize {
        self.key_block
    }

    /// Key ranges that at least one query row can see.
    pub fn visible_blocks(&self, geometry: &MaskGeometry) -> Vec<Range<usize>> {
        (0..geometry.k_len)
            .step_by(self.key_block)
            .map(|start| start..(start + self.key_block).min(geometry.k_len))
            .filter(|keys| !geometry.block_is_masked(keys))
            .collect()
    }
}

impl Default for TiledSigmoidAttention {
    fn default() -> Self {
        Self {
            key_block: DEFAULT_KEY_BLOCK,
            first_call: OnceLock::new(),
        }
    }
}

impl AttentionKernel for TiledSigmoidAttention {
    fn name(&self) -> &'static str {
        "fused"
    }

    fn weighted_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        args: &KernelArgs<'_>,
    ) -> Result<Tensor> {
        args.validate()?;
        let dims = validate_qkv(q, k, v)?;
        let geometry = MaskGeometry::new(dims.q_len, dims.k_len, args.causal, args.window);
        let blocks = self.visible_blocks(&geometry);

        if self.first_call.set(()).is_ok() {
            log::info!(
                "sigmoid_attention::fused init key_block={} heads={} kv_heads={} head_dim={} causal={} window={}",
                self.key_block,
                dims.heads,
                dims.kv_heads,
                dims.head_dim,
                args.causal,
                args.window
            );
        }
        log::debug!(
            "sigmoid_attention::fused visiting {} of {} key blocks",
            blocks.len(),
            dims.k_len.div_ceil(self.key_block)
        );

        let (qh, kh, vh) = heads_first(q, k, v, &dims)?;
        let scale = args.resolved_scale(dims.head_dim);
        let mut acc = Tensor::zeros(
            (dims.batch, dims.heads, dims.q_len, dims.v_dim),
            DType::F32,
            q.device(),
        )?;

        for keys in blocks {
            let k_block = kh.narrow(2, keys.start, keys.len())?.contiguous()?;
            let v_block = vh.narrow(2, keys.start, keys.len())?.contiguous()?;
            let logits = qh
                .matmul(&k_block.t()?)?
                .affine(scale, args.sigmoid_bias as f64)?;
            let bias = LogitBias::build(
                &geometry,
                args.alibi_slopes,
                dims.batch,
                dims.heads,
                keys,
                q.device(),
            )?;
            let weights = weight_dropout(&sigmoid(&bias.apply(&logits)?)?, args.dropout_p)?;
            acc = (acc + weights.matmul(&v_block)?)?;
        }

        restore_layout(&acc, v.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AlibiSlopes, WindowSize};
    use crate::reference::ExactSigmoidAttention;
    use candle_core::{Device, Result as CandleResult};

    fn ramp(shape: (usize, usize, usize, usize), step: f32, device: &Device) -> CandleResult<Tensor> {
        let total = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..total)
            .map(|i| ((i * 5 % 11) as f32 - 5.0) * step)
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    #[test]
    fn matches_reference_for_every_block_width() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = ramp((2, 5, 4, 8), 0.05, &device)?;
        let k = ramp((2, 7, 2, 8), 0.04, &device)?;
        let v = ramp((2, 7, 2, 4), 0.1, &device)?;
        let slopes = AlibiSlopes::geometric(4);
        let policies = [
            KernelArgs::new(0.0),
            KernelArgs::new(-1.5).with_causal(true),
            KernelArgs::new(0.5)
                .with_causal(true)
                .with_window(WindowSize::new(2, -1))
                .with_alibi(&slopes),
            KernelArgs::new(0.0).with_window(WindowSize::new(0, 1)),
        ];
        let reference = ExactSigmoidAttention::new();
        for block in [1, 2, 3, 8] {
            let tiled = TiledSigmoidAttention::new(block).unwrap();
            for args in policies.iter() {
                let expected = reference.weighted_attention(&q, &k, &v, args).unwrap();
                let got = tiled.weighted_attention(&q, &k, &v, args).unwrap();
                let max = got
                    .sub(&expected)?
                    .abs()?
                    .flatten_all()?
                    .max(0)?
                    .to_vec0::<f32>()?;
                assert!(max < 1e-5, "block {block} {args:?} diverged by {max}");
            }
        }
        Ok(())
    }

    #[test]
    fn skips_blocks_hidden_by_the_window() {
        let tiled = TiledSigmoidAttention::new(2).unwrap();
        let geometry = MaskGeometry::new(2, 8, true, WindowSize::new(1, -1));
        // offset 6: rows see keys 5..=6 and 6..=7.
        assert_eq!(tiled.visible_blocks(&geometry), vec![4..6, 6..8]);

        let open = MaskGeometry::new(2, 5, false, WindowSize::UNBOUNDED);
        assert_eq!(tiled.visible_blocks(&open), vec![0..2, 2..4, 4..5]);
    }

    #[test]
    fn zero_block_width_is_rejected() {
        assert!(matches!(
            TiledSigmoidAttention::new(0),
            Err(AttentionError::Configuration { .. })
        ));
    }
}
