use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use cairn_types::{AliasEntry, BlobLocator, RefName, RefTarget};
use tokio::io::AsyncRead;

use crate::error::BackendResult;

/// Stream over a blob's bytes.
pub type BlobStream = Pin<Box<dyn AsyncRead + Send>>;

/// Generic blob/ref/alias storage consumed by the bundle engine.
///
/// All implementations must satisfy these invariants:
/// - Blobs are immutable once written; `write_blob` returns a fresh locator.
/// - `write_blob` is atomic: either the whole blob becomes readable or the
///   call fails and nothing is visible.
/// - Locators passed in never carry a fragment.
/// - All errors are propagated, never silently ignored.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read `length` bytes starting at `offset`, or the rest of the blob when
    /// `length` is `None`. Reads past the end are clamped.
    async fn read_blob(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: Option<u64>,
    ) -> BackendResult<Bytes>;

    /// Open a stream over a range of a blob.
    ///
    /// Default implementation reads the range into memory.
    async fn open_blob(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: Option<u64>,
    ) -> BackendResult<BlobStream> {
        let data = self.read_blob(locator, offset, length).await?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    /// Store a blob and return its locator.
    ///
    /// `imports` lists the blobs this one references (for backend-side
    /// reachability tracking); `prefix` is a path hint for the new locator.
    async fn write_blob(
        &self,
        data: Bytes,
        imports: &[BlobLocator],
        prefix: Option<&str>,
    ) -> BackendResult<BlobLocator>;

    /// Read a ref. Returns `Ok(None)` if it does not exist.
    async fn read_ref(&self, name: &RefName) -> BackendResult<Option<RefTarget>>;

    /// Create or replace a ref.
    async fn write_ref(&self, name: &RefName, target: &RefTarget) -> BackendResult<()>;

    /// Delete a ref. Returns `true` if it existed.
    async fn delete_ref(&self, name: &RefName) -> BackendResult<bool>;

    /// Register `locator` under an alias name.
    async fn add_alias(
        &self,
        name: &RefName,
        locator: &BlobLocator,
        rank: i32,
        data: &[u8],
    ) -> BackendResult<()>;

    /// Remove `locator` from an alias name.
    async fn remove_alias(&self, name: &RefName, locator: &BlobLocator) -> BackendResult<()>;

    /// Entries registered under `name`, highest rank first.
    async fn find_aliases(
        &self,
        name: &RefName,
        max_results: Option<usize>,
    ) -> BackendResult<Vec<AliasEntry>>;
}
