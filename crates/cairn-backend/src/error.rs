use cairn_types::{BlobLocator, RefName};

/// Errors reported by a storage backend.
///
/// The bundle engine never retries these; they are propagated unchanged to
/// the caller of the operation that triggered them.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The requested blob does not exist.
    #[error("blob not found: {0}")]
    BlobNotFound(BlobLocator),

    /// The requested ref does not exist.
    #[error("ref not found: {0}")]
    RefNotFound(RefName),

    /// A range read started past the end of the blob.
    #[error("offset {offset} is beyond the end of {locator} ({length} bytes)")]
    OutOfRange {
        locator: BlobLocator,
        offset: u64,
        length: u64,
    },

    /// Locators handed to the backend must not carry a fragment.
    #[error("locator {0} has a fragment; backends address whole blobs")]
    UnexpectedFragment(BlobLocator),

    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure reported by the backend (transport, quota, ...).
    #[error("backend error: {0}")]
    Other(String),
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
