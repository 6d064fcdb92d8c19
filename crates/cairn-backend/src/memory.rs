use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cairn_types::{AliasEntry, BlobLocator, RefName, RefTarget};
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{BackendError, BackendResult};
use crate::traits::StorageBackend;

/// In-memory, HashMap-based backend.
///
/// Intended for tests and embedding. Every operation is counted so callers
/// can assert how much backend I/O a code path performed, and writes can be
/// made to fail on demand.
pub struct InMemoryBackend {
    blobs: RwLock<HashMap<BlobLocator, Bytes>>,
    refs: RwLock<HashMap<RefName, RefTarget>>,
    aliases: RwLock<HashMap<RefName, Vec<AliasEntry>>>,
    write_log: RwLock<Vec<BlobLocator>>,
    read_count: AtomicU64,
    read_bytes: AtomicU64,
    failing_writes: AtomicUsize,
    read_delay: Option<Duration>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            refs: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            write_log: RwLock::new(Vec::new()),
            read_count: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            failing_writes: AtomicUsize::new(0),
            read_delay: None,
        }
    }

    /// Delay every blob read, widening the window for concurrent callers.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Number of `read_blob` calls served so far.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Total bytes returned by `read_blob`.
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.read_count.store(0, Ordering::SeqCst);
        self.read_bytes.store(0, Ordering::SeqCst);
    }

    /// Locators in the order their writes completed.
    pub fn write_log(&self) -> Vec<BlobLocator> {
        self.write_log.read().clone()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    /// Raw contents of a stored blob.
    pub fn blob(&self, locator: &BlobLocator) -> Option<Bytes> {
        self.blobs.read().get(locator).cloned()
    }

    /// Make the next `count` calls to `write_blob` fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_base(locator: &BlobLocator) -> BackendResult<()> {
        if locator.has_fragment() {
            return Err(BackendError::UnexpectedFragment(locator.clone()));
        }
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn read_blob(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: Option<u64>,
    ) -> BackendResult<Bytes> {
        Self::check_base(locator)?;
        self.read_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }

        let blob = self
            .blobs
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| BackendError::BlobNotFound(locator.clone()))?;

        let total = blob.len() as u64;
        if offset > total {
            return Err(BackendError::OutOfRange {
                locator: locator.clone(),
                offset,
                length: total,
            });
        }
        let end = match length {
            Some(length) => offset.saturating_add(length).min(total),
            None => total,
        };
        let data = blob.slice(offset as usize..end as usize);
        self.read_bytes.fetch_add(data.len() as u64, Ordering::SeqCst);
        trace!(%locator, offset, len = data.len(), "read blob");
        Ok(data)
    }

    async fn write_blob(
        &self,
        data: Bytes,
        imports: &[BlobLocator],
        prefix: Option<&str>,
    ) -> BackendResult<BlobLocator> {
        for import in imports {
            Self::check_base(import)?;
        }
        let should_fail = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BackendError::Other("injected write failure".into()));
        }

        let id = uuid::Uuid::now_v7().simple().to_string();
        let locator = match prefix {
            Some(prefix) if !prefix.is_empty() => BlobLocator::new(format!("{prefix}/{id}")),
            _ => BlobLocator::new(id),
        };
        trace!(%locator, len = data.len(), imports = imports.len(), "write blob");

        self.blobs.write().insert(locator.clone(), data);
        self.write_log.write().push(locator.clone());
        Ok(locator)
    }

    async fn read_ref(&self, name: &RefName) -> BackendResult<Option<RefTarget>> {
        Ok(self.refs.read().get(name).cloned())
    }

    async fn write_ref(&self, name: &RefName, target: &RefTarget) -> BackendResult<()> {
        self.refs.write().insert(name.clone(), target.clone());
        Ok(())
    }

    async fn delete_ref(&self, name: &RefName) -> BackendResult<bool> {
        Ok(self.refs.write().remove(name).is_some())
    }

    async fn add_alias(
        &self,
        name: &RefName,
        locator: &BlobLocator,
        rank: i32,
        data: &[u8],
    ) -> BackendResult<()> {
        let mut aliases = self.aliases.write();
        let entries = aliases.entry(name.clone()).or_default();
        entries.retain(|entry| &entry.locator != locator);
        entries.push(AliasEntry {
            locator: locator.clone(),
            rank,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn remove_alias(&self, name: &RefName, locator: &BlobLocator) -> BackendResult<()> {
        let mut aliases = self.aliases.write();
        if let Some(entries) = aliases.get_mut(name) {
            entries.retain(|entry| &entry.locator != locator);
            if entries.is_empty() {
                aliases.remove(name);
            }
        }
        Ok(())
    }

    async fn find_aliases(
        &self,
        name: &RefName,
        max_results: Option<usize>,
    ) -> BackendResult<Vec<AliasEntry>> {
        let mut entries = self.aliases.read().get(name).cloned().unwrap_or_default();
        entries.sort_by(|a, b| b.rank.cmp(&a.rank));
        if let Some(max) = max_results {
            entries.truncate(max);
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("blob_count", &self.blob_count())
            .field("read_count", &self.read_count())
            .finish()
    }
}
