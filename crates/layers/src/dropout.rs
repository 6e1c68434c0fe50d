//! Output dropout applied after the attention projection.
//!
//! Masks are drawn from candle's process-wide random source, so two
//! concurrent training-mode forward calls interleave their draws. Callers that
//! need reproducible masks must serialise those calls themselves.

use candle_core::{Error, Result, Tensor};

/// Inverted dropout: surviving activations are rescaled by `1 / (1 - p)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    probability: f32,
}

impl Dropout {
    /// Builds a dropout layer; `probability` must lie in `[0, 1)`.
    pub fn new(probability: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        Ok(Self { probability })
    }

    /// Whether a training-mode call would touch the input.
    pub fn is_active(&self) -> bool {
        self.probability > 0.0
    }

    /// Applies dropout when `train` is set; evaluation returns the input as-is.
    pub fn forward_t(&self, hidden: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.is_active() {
            candle_nn::ops::dropout(hidden, self.probability)
        } else {
            Ok(hidden.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn rejects_out_of_range_probabilities() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(0.0).is_ok());
    }

    #[test]
    fn evaluation_mode_is_identity() -> Result<()> {
        let input = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu)?;
        let dropout = Dropout::new(0.5)?;
        let out = dropout.forward_t(&input, false)?;
        let diff = out.sub(&input)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn training_mode_zeroes_or_rescales() -> Result<()> {
        let input = Tensor::ones((4, 64), DType::F32, &Device::Cpu)?;
        let dropout = Dropout::new(0.5)?;
        let values = dropout
            .forward_t(&input, true)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(values
            .iter()
            .all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!(values.iter().any(|&v| v == 0.0));
        Ok(())
    }
}
