//! Layer-facing wrappers around a kernel: prescaling and output flattening.
//!
//! With prescaling on, `q` and `k` are each multiplied by `head_dim^-0.25`
//! and the kernel runs with a unit scale, so the logits still equal the
//! `head_dim^-0.5` default. Without it the kernel applies its default scale.

use candle_core::Tensor;

use crate::core::{AttentionError, AttentionKernel, AttentionPolicy, KernelArgs, Result};

/// Factor applied to each of q and k when prescaling.
pub fn prescale_factor(head_dim: usize) -> f64 {
    (head_dim as f64).powf(-0.25)
}

/// Runs `kernel` on separate q, k, v under `policy`; returns
/// `[batch, q_len, heads * v_dim]`.
pub fn sigmoid_attention(
    kernel: &dyn AttentionKernel,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    policy: &AttentionPolicy,
    train: bool,
) -> Result<Tensor> {
    let (_, _, _, head_dim) = q.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "q must be [batch, seq, heads, head_dim], got {:?}",
            q.dims()
        ))
    })?;
    let args = KernelArgs::from_policy(policy, train);
    let out = if policy.prescale {
        let factor = prescale_factor(head_dim);
        kernel.weighted_attention(
            &q.affine(factor, 0.0)?,
            &k.affine(factor, 0.0)?,
            v,
            &args.with_softmax_scale(Some(1.0)),
        )?
    } else {
        kernel.weighted_attention(q, k, v, &args)?
    };
    Ok(out.flatten_from(2)?)
}

/// Packed variant; `qkv` is `[batch, seq, 3, heads, head_dim]`.
pub fn packed_sigmoid_attention(
    kernel: &dyn AttentionKernel,
    qkv: &Tensor,
    policy: &AttentionPolicy,
    train: bool,
) -> Result<Tensor> {
    let args = KernelArgs::from_policy(policy, train);
    let out = if policy.prescale {
        kernel.weighted_attention_packed(
            &prescale_packed(qkv)?,
            &args.with_softmax_scale(Some(1.0)),
        )?
    } else {
        kernel.weighted_attention_packed(qkv, &args)?
    };
    Ok(out.flatten_from(2)?)
}

/// Scales the q and k slices of a packed tensor; v is left untouched.
pub fn prescale_packed(qkv: &Tensor) -> Result<Tensor> {
    let (_, _, three, _, head_dim) = qkv.dims5().map_err(|_| {
        AttentionError::shape(format!(
            "packed qkv must be [batch, seq, 3, heads, head_dim], got {:?}",
            qkv.dims()
        ))
    })?;
    if three != 3 {
        return Err(AttentionError::shape(format!(
            "packed qkv axis 2 must hold 3 entries, got {three}"
        )));
    }
    let factor = prescale_factor(head_dim) as f32;
    let factors = Tensor::new(&[factor, factor, 1.0f32], qkv.device())?
        .to_dtype(qkv.dtype())?
        .reshape((1, 1, 3, 1, 1))?;
    Ok(qkv.broadcast_mul(&factors)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AlibiSlopes, WindowSize};
    use crate::reference::ExactSigmoidAttention;
    use candle_core::{DType, Device, Result as CandleResult};
    use std::sync::Mutex;

    /// Records the scale each call received and forwards to the reference.
    #[derive(Debug, Default)]
    struct RecordingKernel {
        scales: Mutex<Vec<Option<f32>>>,
        values: Mutex<Vec<Tensor>>,
        inner: ExactSigmoidAttention,
    }

    impl AttentionKernel for RecordingKernel {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn weighted_attention(
            &self,
            q: &Tensor,
            k: &Tensor,
            v: &Tensor,
            args: &KernelArgs<'_>,
        ) -> Result<Tensor> {
            self.scales.lock().unwrap().push(args.softmax_scale);
            self.values.lock().unwrap().push(v.clone());
            self.inner.weighted_attention(q, k, v, args)
        }
    }

    fn inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let make = |seed: usize| -> CandleResult<Tensor> {
            let data: Vec<f32> = (0..2 * 4 * 2 * 16)
                .map(|i| (((i + seed) * 13 % 17) as f32 - 8.0) * 0.1)
                .collect();
            Tensor::from_vec(data, (2, 4, 2, 16), device)
        };
        Ok((make(0)?, make(3)?, make(7)?))
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()
    }

    #[test]
    fn prescale_matches_default_scale() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device)?;
        let kernel = RecordingKernel::default();
        let slopes = AlibiSlopes::geometric(2);
        let policy = AttentionPolicy::default()
            .with_causal(true)
            .with_sigmoid_bias(-2.0)
            .with_window(WindowSize::new(2, -1))
            .with_alibi(slopes);

        let scaled = sigmoid_attention(&kernel, &q, &k, &v, &policy, false).unwrap();
        let unscaled = sigmoid_attention(
            &kernel,
            &q,
            &k,
            &v,
            &policy.clone().with_prescale(false),
            false,
        )
        .unwrap();

        assert_eq!(scaled.dims(), &[2, 4, 32]);
        assert!(max_diff(&scaled, &unscaled)? < 1e-5);
        assert_eq!(*kernel.scales.lock().unwrap(), vec![Some(1.0), None]);
        Ok(())
    }

    #[test]
    fn packed_prescale_leaves_values_alone() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device)?;
        let qkv = Tensor::stack(&[&q, &k, &v], 2)?;
        let scaled = prescale_packed(&qkv).unwrap();
        let factor = 16f64.powf(-0.25);

        let q_scaled = scaled.narrow(2, 0, 1)?.squeeze(2)?;
        let k_scaled = scaled.narrow(2, 1, 1)?.squeeze(2)?;
        let v_scaled = scaled.narrow(2, 2, 1)?.squeeze(2)?;
        assert!(max_diff(&q_scaled, &q.affine(factor, 0.0)?)? < 1e-6);
        assert!(max_diff(&k_scaled, &k.affine(factor, 0.0)?)? < 1e-6);
        assert_eq!(max_diff(&v_scaled, &v)?, 0.0);

        let kernel = RecordingKernel::default();
        let policy = AttentionPolicy::default().with_causal(true);
        packed_sigmoid_attention(&kernel, &qkv, &policy, false).unwrap();
        let seen = kernel.values.lock().unwrap()[0].clone();
        assert_eq!(max_diff(&seen, &v)?, 0.0);
        Ok(())
    }

    #[test]
    fn packed_and_unpacked_agree() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device)?;
        let qkv = Tensor::stack(&[&q, &k, &v], 2)?;
        let kernel = ExactSigmoidAttention::new();
        for prescale in [true, false] {
            let policy = AttentionPolicy::default()
                .with_causal(true)
                .with_sigmoid_bias(-1.0)
                .with_prescale(prescale);
            let unpacked = sigmoid_attention(&kernel, &q, &k, &v, &policy, false).unwrap();
            let packed = packed_sigmoid_attention(&kernel, &qkv, &policy, false).unwrap();
            assert!(max_diff(&unpacked, &packed)? < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn evaluation_mode_disables_weight_dropout() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device)?;
        let kernel = ExactSigmoidAttention::new();
        let noisy = AttentionPolicy::default().with_attn_dropout(0.9);
        let clean = AttentionPolicy::default();
        let a = sigmoid_attention(&kernel, &q, &k, &v, &noisy, false).unwrap();
        let b = sigmoid_attention(&kernel, &q, &k, &v, &clean, false).unwrap();
        assert_eq!(max_diff(&a, &b)?, 0.0);
        Ok(())
    }

    #[test]
    fn bf16_prescale_keeps_dtype() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device)?;
        let qkv = Tensor::stack(&[&q, &k, &v], 2)?.to_dtype(DType::BF16)?;
        let out = packed_sigmoid_attention(
            &ExactSigmoidAttention::new(),
            &qkv,
            &AttentionPolicy::default(),
            false,
        )
        .unwrap();
        assert_eq!(out.dtype(), DType::BF16);
        assert_eq!(out.dims(), &[2, 4, 32]);
        Ok(())
    }
}
