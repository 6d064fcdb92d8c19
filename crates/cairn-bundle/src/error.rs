use thiserror::Error;

use crate::compression::BundleCompressionFormat;

/// Errors raised while encoding or decoding bundles.
///
/// Every variant except [`BundleError::CompressionFailed`] means the input
/// bytes are not a valid bundle (or packet). These are never recovered from.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("invalid bundle signature: {actual:?}")]
    InvalidSignature { actual: String },

    #[error("unsupported bundle version: {0}")]
    UnsupportedVersion(u8),

    #[error("truncated bundle data: needed {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("corrupt bundle header: {0}")]
    InvalidHeader(String),

    #[error("unknown compression format: {0}")]
    UnknownCompression(u8),

    #[error("compression format {0} is not available in this build")]
    UnsupportedCompression(BundleCompressionFormat),

    #[error("{format} compression failed: {reason}")]
    CompressionFailed {
        format: BundleCompressionFormat,
        reason: String,
    },

    #[error("{format} decompression failed: {reason}")]
    DecompressionFailed {
        format: BundleCompressionFormat,
        reason: String,
    },

    #[error("decoded length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

impl BundleError {
    /// Whether this error means the input data is corrupt or unreadable.
    pub fn is_invalid_data(&self) -> bool {
        !matches!(self, Self::CompressionFailed { .. })
    }
}

pub type BundleResult<T> = Result<T, BundleError>;
