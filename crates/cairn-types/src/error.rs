use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid locator fragment in {locator:?}: {reason}")]
    InvalidFragment { locator: String, reason: String },

    #[error("invalid ref name {name:?}: {reason}")]
    InvalidRefName { name: String, reason: String },
}
