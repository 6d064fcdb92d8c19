use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use cairn_backend::StorageBackend;
use cairn_bundle::BundleHeader;
use cairn_cache::{BundleCache, CacheStats};
use cairn_types::{BlobLocator, IoHash, RefName, RefTarget};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::{StorageConfig, WriterOptions};
use crate::error::{StorageError, StorageResult};
use crate::handle::{BlobHandle, NodeData};
use crate::node::{NodeArena, WriterId};
use crate::reader::{BundleReader, MountFuture};
use crate::writer::{BundleWriter, WriterShared};

/// State shared by a client, its handles, and its writers.
pub(crate) struct ClientInner {
    pub backend: Arc<dyn StorageBackend>,
    pub config: StorageConfig,
    pub cache: BundleCache<BundleReader>,
    pub nodes: Mutex<NodeArena>,
    pub read_limit: Semaphore,
    pub mounts: DashMap<BlobLocator, MountFuture>,
    writers: Mutex<HashMap<WriterId, Weak<WriterShared>>>,
    next_writer: AtomicU64,
    sequence: AtomicU64,
}

impl ClientInner {
    pub(crate) fn next_writer_id(&self) -> WriterId {
        WriterId(self.next_writer.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Next bundle publication number; the first is 1.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn register_writer(&self, writer: &Arc<WriterShared>) {
        self.writers
            .lock()
            .insert(writer.id(), Arc::downgrade(writer));
    }

    pub(crate) fn unregister_writer(&self, id: WriterId) {
        self.writers.lock().remove(&id);
    }

    /// Flush whichever writer owns queued nodes. A writer that has gone away
    /// already released its nodes.
    pub(crate) async fn flush_writer(&self, id: WriterId) -> StorageResult<()> {
        let writer = self.writers.lock().get(&id).and_then(Weak::upgrade);
        match writer {
            Some(writer) => writer.flush().await,
            None => {
                // The writer may still be releasing its queue.
                tokio::task::yield_now().await;
                Ok(())
            }
        }
    }

    pub(crate) fn create_node(
        self: &Arc<Self>,
        data: Bytes,
        references: &[BlobHandle],
    ) -> StorageResult<BlobHandle> {
        let mut nodes = self.nodes.lock();
        let mut ids = Vec::with_capacity(references.len());
        for reference in references {
            if !reference.belongs_to(self) {
                return Err(StorageError::InvalidLocator(
                    "handle belongs to a different storage client".into(),
                ));
            }
            let id = reference.resolve_in(&mut nodes)?.ok_or_else(|| {
                StorageError::InvalidLocator(format!(
                    "{:?} is a raw blob and cannot be referenced",
                    reference.target()
                ))
            })?;
            ids.push(id);
        }
        let id = nodes.insert(data, ids)?;
        Ok(BlobHandle::node(Arc::clone(self), id))
    }
}

/// Entry point of the storage engine.
///
/// Wraps a backend with the read cache, the node records, and the writers
/// built on top of them. Cloning is cheap and clones share everything.
#[derive(Clone)]
pub struct StorageClient {
    inner: Arc<ClientInner>,
}

/// A ranked alias resolved to a handle.
#[derive(Clone, Debug)]
pub struct Alias {
    pub handle: BlobHandle,
    pub rank: i32,
    pub data: Vec<u8>,
}

impl StorageClient {
    pub fn new(backend: Arc<dyn StorageBackend>, config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        let inner = ClientInner {
            backend,
            cache: BundleCache::new(config.cache.clone()),
            read_limit: Semaphore::new(config.max_concurrent_reads),
            nodes: Mutex::new(NodeArena::default()),
            mounts: DashMap::new(),
            writers: Mutex::new(HashMap::new()),
            next_writer: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    /// Handle for a locator: `loc` is a raw blob, `loc#e` a V1 export and
    /// `loc#p&e` a V2 export.
    pub fn create_handle(
        &self,
        locator: &BlobLocator,
        hash: Option<IoHash>,
    ) -> StorageResult<BlobHandle> {
        BlobHandle::from_locator(Arc::clone(&self.inner), locator, hash)
    }

    /// Unwritten node with the given bytes and references. Identical content
    /// and references yield the same node.
    pub fn create_node(
        &self,
        data: impl Into<Bytes>,
        references: &[BlobHandle],
    ) -> StorageResult<BlobHandle> {
        self.inner.create_node(data.into(), references)
    }

    pub fn create_writer(&self, options: WriterOptions) -> StorageResult<BundleWriter> {
        BundleWriter::create(&self.inner, &options)
    }

    pub async fn add_alias(
        &self,
        name: &RefName,
        handle: &BlobHandle,
        rank: i32,
        data: &[u8],
    ) -> StorageResult<()> {
        handle.flush().await?;
        let locator = handle.try_locator()?;
        self.inner
            .backend
            .add_alias(name, &locator, rank, data)
            .await?;
        debug!(alias = %name, locator = %locator, rank, "added alias");
        Ok(())
    }

    pub async fn remove_alias(&self, name: &RefName, handle: &BlobHandle) -> StorageResult<()> {
        handle.flush().await?;
        let locator = handle.try_locator()?;
        self.inner.backend.remove_alias(name, &locator).await?;
        debug!(alias = %name, locator = %locator, "removed alias");
        Ok(())
    }

    /// Aliases registered under `name`, highest rank first.
    pub async fn find_aliases(
        &self,
        name: &RefName,
        max_results: Option<usize>,
    ) -> StorageResult<Vec<Alias>> {
        let entries = self.inner.backend.find_aliases(name, max_results).await?;
        entries
            .into_iter()
            .map(|entry| {
                Ok(Alias {
                    handle: self.create_handle(&entry.locator, None)?,
                    rank: entry.rank,
                    data: entry.data,
                })
            })
            .collect()
    }

    /// Flush `handle` and point `name` at it.
    pub async fn write_ref(&self, name: &RefName, handle: &BlobHandle) -> StorageResult<()> {
        handle.flush().await?;
        let locator = handle.try_locator()?;
        let target = RefTarget::new(handle.hash().unwrap_or(IoHash::ZERO), locator.clone());
        self.inner.backend.write_ref(name, &target).await?;
        info!(name = %name, locator = %locator, "published ref");
        Ok(())
    }

    pub async fn try_read_ref(&self, name: &RefName) -> StorageResult<Option<BlobHandle>> {
        match self.inner.backend.read_ref(name).await? {
            Some(target) => Ok(Some(self.create_handle(
                &target.locator,
                Some(target.hash).filter(|hash| !hash.is_zero()),
            )?)),
            None => Ok(None),
        }
    }

    pub async fn delete_ref(&self, name: &RefName) -> StorageResult<bool> {
        let deleted = self.inner.backend.delete_ref(name).await?;
        if deleted {
            info!(name = %name, "deleted ref");
        }
        Ok(deleted)
    }

    pub async fn read_node(&self, handle: &BlobHandle) -> StorageResult<NodeData> {
        if !handle.belongs_to(&self.inner) {
            return Err(StorageError::InvalidLocator(
                "handle belongs to a different storage client".into(),
            ));
        }
        handle.read_node().await
    }

    /// Parsed header of a bundle, through the header cache.
    pub async fn read_bundle_header(&self, locator: &BlobLocator) -> StorageResult<Arc<BundleHeader>> {
        Ok(self.inner.header(&locator.base()).await?.header)
    }

    /// Bundles referenced by a bundle, for garbage collection. Only the
    /// header is read; no packet is decoded.
    pub async fn read_bundle_references(&self, locator: &BlobLocator) -> StorageResult<Vec<BlobLocator>> {
        let base = locator.base();
        let header = self.inner.header(&base).await?.header;
        let references: Vec<BlobLocator> = header
            .import_locators()
            .into_iter()
            .filter(|import| *import != base)
            .collect();
        debug!(bundle = %base, references = references.len(), "read bundle references");
        Ok(references)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Drop every cached reader, page, header, and packet.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("config", &self.inner.config)
            .field("nodes", &self.inner.nodes.lock().len())
            .finish()
    }
}
