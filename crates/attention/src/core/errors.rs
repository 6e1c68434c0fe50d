//! Error types emitted by the attention kernels and layers.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// A construction-time invariant does not hold (head divisibility, slope
    /// counts, dropout ranges on layer parameters).
    #[error("invalid attention configuration: {reason}")]
    Configuration { reason: String },
    /// Tensor shapes do not line up with the documented layout.
    #[error("shape mismatch: {context}")]
    ShapeMismatch { context: String },
    /// The kernel cannot express the requested masking or dropout policy.
    #[error("unsupported attention configuration: {reason}")]
    UnsupportedConfiguration { reason: String },
    /// The requested kernel backend was not compiled into this build.
    #[error("attention backend `{backend}` is not available in this build")]
    BackendUnavailable { backend: &'static str },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A tensor library failure propagated to the caller.
    #[error("tensor backend error: {message}")]
    Backend { message: String },
}

impl AttentionError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration {
            reason: reason.into(),
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AttentionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_errors_become_backend_errors() {
        let err: AttentionError = candle_core::Error::Msg("boom".to_string()).into();
        match err {
            AttentionError::Backend { message } => assert!(message.contains("boom")),
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn display_names_the_backend() {
        let err = AttentionError::BackendUnavailable { backend: "fused" };
        assert_eq!(
            err.to_string(),
            "attention backend `fused` is not available in this build"
        );
    }
}
