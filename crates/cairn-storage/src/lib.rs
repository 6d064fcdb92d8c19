//! Storage client for Cairn.
//!
//! Ties a [`StorageBackend`](cairn_backend::StorageBackend) to the bundle
//! format and the read cache. Applications create nodes, queue them on a
//! [`BundleWriter`], and get back [`BlobHandle`]s that can be read, aliased,
//! or published as refs once flushed.
//!
//! # Lifecycle of a node
//!
//! ```text
//! create_node ──▶ InMemory ──write_node──▶ queued ──batch cut──▶ Writing
//!                                                                  │
//!                  Imported ──mount──▶ Exported ◀──published────────┘
//! ```
//!
//! Reads go through the [`BundleCache`](cairn_cache::BundleCache): headers and
//! pages are fetched once per client no matter how many tasks ask for them.

mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod node;
pub mod reader;
pub mod writer;

pub use client::{Alias, StorageClient};
pub use config::{StorageConfig, WriterOptions};
pub use error::{StorageError, StorageResult};
pub use handle::{BlobHandle, HandleTarget, NodeData};
pub use node::{ExportLocation, NodeId, WriterId};
pub use reader::BundleReader;
pub use writer::BundleWriter;

// Re-export key types
pub use cairn_backend::{InMemoryBackend, StorageBackend};
pub use cairn_bundle::{BundleCompressionFormat, BundleFormat, BundleVersion};
pub use cairn_cache::{CacheConfig, CacheStats};
pub use cairn_types::{BlobLocator, IoHash, RefName};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn quickstart() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let client = StorageClient::new(backend, StorageConfig::default()).unwrap();
        let writer = client.create_writer(WriterOptions::default()).unwrap();

        let leaf = writer.add_node(&b"leaf"[..], &[]).await.unwrap();
        let root = writer.add_node(&b"root"[..], &[leaf.clone()]).await.unwrap();
        let name = RefName::new("quickstart").unwrap();
        writer.write_ref(&name, &root).await.unwrap();

        let handle = client.try_read_ref(&name).await.unwrap().unwrap();
        let node = client.read_node(&handle).await.unwrap();
        assert_eq!(&node.data[..], b"root");
        assert_eq!(node.references.len(), 1);
        let child = client.read_node(&node.references[0]).await.unwrap();
        assert_eq!(&child.data[..], b"leaf");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let config = StorageConfig {
            max_concurrent_reads: 0,
            ..StorageConfig::default()
        };
        let err = StorageClient::new(backend, config).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
