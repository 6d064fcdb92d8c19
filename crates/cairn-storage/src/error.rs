use std::sync::Arc;

use cairn_backend::BackendError;
use cairn_bundle::BundleError;
use thiserror::Error;

use crate::node::{NodeId, WriterId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    #[error("node {0} has not been flushed")]
    NotFlushed(NodeId),

    #[error("node {node} is not queued on writer {writer}")]
    NotQueued { node: NodeId, writer: WriterId },

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Failure of a shared operation (cache load, mount, batch write),
    /// reported to every caller that awaited it.
    #[error("{0}")]
    Shared(Arc<StorageError>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// The underlying error, looking through shared wrappers.
    pub fn root(&self) -> &StorageError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether the error comes from malformed stored data rather than I/O
    /// or misuse.
    pub fn is_invalid_data(&self) -> bool {
        match self.root() {
            Self::Bundle(e) => e.is_invalid_data(),
            Self::InvalidLocator(_) => true,
            _ => false,
        }
    }
}

impl From<Arc<StorageError>> for StorageError {
    fn from(err: Arc<StorageError>) -> Self {
        Self::Shared(err)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
