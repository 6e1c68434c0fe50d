//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking. Every helper takes a
//! `label` naming the tensor under inspection so failures point at the
//! offending parameter.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.rank();
    if actual == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got {actual} ({:?})",
            tensor.dims()
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Validates that the trailing (feature) dimension equals `features`.
pub fn expect_last_dim(label: &str, tensor: &Tensor, features: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == features => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected trailing dimension {features}, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
/// Empty batches and empty sequences are rejected.
pub fn expect_batch_seq_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [batch, seq, _] if *batch == 0 || *seq == 0 => Err(Error::Msg(format!(
            "{label}: batch and sequence must be non-empty, got {:?}",
            tensor.dims()
        ))),
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Rejects strided views where a packed buffer is required.
pub fn expect_contiguous(label: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{label}: tensor must be contiguous")))
    }
}

/// Guards casts between floating point dtypes used for parameters.
pub fn ensure_cast_supported(label: &str, from: DType, to: DType) -> Result<()> {
    let float = |dtype: DType| matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64);
    if float(from) && float(to) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: unsupported cast from {from:?} to {to:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn last_dim_check_accepts_per_head_layouts() -> Result<()> {
        let tensor = Tensor::zeros((2, 3, 4, 8), DType::F32, &Device::Cpu)?;
        expect_last_dim("heads", &tensor, 8)?;
        assert!(expect_last_dim("heads", &tensor, 4).is_err());
        Ok(())
    }

    #[test]
    fn batch_seq_hidden_rejects_rank_four() -> Result<()> {
        let tensor = Tensor::zeros((2, 3, 4, 8), DType::F32, &Device::Cpu)?;
        let err = expect_batch_seq_hidden("input", &tensor, 8).unwrap_err();
        assert!(err.to_string().contains("input"));
        Ok(())
    }

    #[test]
    fn batch_seq_hidden_rejects_empty_sequences() -> Result<()> {
        let empty = Tensor::zeros((2, 0, 8), DType::F32, &Device::Cpu)?;
        let err = expect_batch_seq_hidden("input", &empty, 8).unwrap_err();
        assert!(err.to_string().contains("non-empty"));
        let no_batch = Tensor::zeros((0, 3, 8), DType::F32, &Device::Cpu)?;
        assert!(expect_batch_seq_hidden("input", &no_batch, 8).is_err());
        Ok(())
    }

    #[test]
    fn integer_casts_are_rejected() {
        assert!(ensure_cast_supported("w", DType::F32, DType::BF16).is_ok());
        assert!(ensure_cast_supported("w", DType::U32, DType::F32).is_err());
    }
}
