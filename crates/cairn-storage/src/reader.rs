//! Read path: pages, headers, packets, and bundle mounts.
//!
//! Every backend read goes through the page tier and the per-client read
//! semaphore. Headers are parsed from a bounded prefix (plus the exact
//! remainder when the header is longer) and packets are decoded on demand.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use cairn_backend::BlobStream;
use cairn_bundle::{BundleError, BundleHeader, BundleSignature};
use cairn_cache::{CachedHeader, PacketForm, PacketKey};
use cairn_types::{BlobLocator, IoHash};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::SemaphorePermit;
use tracing::debug;

use crate::client::ClientInner;
use crate::error::{StorageError, StorageResult};
use crate::node::{ExportLocation, NodeId, NodeState};

/// In-flight or completed mount of one bundle.
pub(crate) type MountFuture = Shared<BoxFuture<'static, Result<(), Arc<StorageError>>>>;

/// A bundle whose header has been parsed, ready to serve packets.
#[derive(Debug)]
pub struct BundleReader {
    locator: BlobLocator,
    header: Arc<BundleHeader>,
    header_length: usize,
    packet_offsets: Vec<u64>,
}

impl BundleReader {
    pub(crate) fn new(locator: BlobLocator, cached: CachedHeader) -> Self {
        let packet_offsets = cached.header.packet_offsets();
        Self {
            locator,
            header: cached.header,
            header_length: cached.length,
            packet_offsets,
        }
    }

    pub fn locator(&self) -> &BlobLocator {
        &self.locator
    }

    pub fn header(&self) -> &Arc<BundleHeader> {
        &self.header
    }

    pub fn header_length(&self) -> usize {
        self.header_length
    }

    /// Absolute offset and encoded length of a packet.
    pub fn packet_range(&self, packet: u32) -> StorageResult<(u64, u32)> {
        let index = packet as usize;
        match (self.header.packets.get(index), self.packet_offsets.get(index)) {
            (Some(entry), Some(offset)) => Ok((
                self.header_length as u64 + offset,
                entry.encoded_length,
            )),
            _ => Err(BundleError::InvalidHeader(format!(
                "{} has no packet {packet}",
                self.locator
            ))
            .into()),
        }
    }
}

/// Bytes and references of one node.
#[derive(Debug)]
pub(crate) struct NodeContent {
    pub hash: IoHash,
    pub data: Bytes,
    pub references: Vec<NodeId>,
}

impl ClientInner {
    async fn read_permit(&self) -> StorageResult<SemaphorePermit<'_>> {
        self.read_limit
            .acquire()
            .await
            .map_err(|_| StorageError::Internal("read limiter closed".into()))
    }

    async fn read_backend(&self, locator: &BlobLocator, offset: u64, length: u64) -> StorageResult<Bytes> {
        let _permit = self.read_permit().await?;
        Ok(self.backend.read_blob(locator, offset, Some(length)).await?)
    }

    /// Read a whole blob, bypassing the page tier.
    pub(crate) async fn read_blob(&self, locator: &BlobLocator) -> StorageResult<Bytes> {
        let _permit = self.read_permit().await?;
        Ok(self.backend.read_blob(locator, 0, None).await?)
    }

    pub(crate) async fn open_blob(&self, locator: &BlobLocator) -> StorageResult<BlobStream> {
        let _permit = self.read_permit().await?;
        Ok(self.backend.open_blob(locator, 0, None).await?)
    }

    async fn read_page(&self, locator: &BlobLocator, page: u64) -> StorageResult<Bytes> {
        let size = self.cache.page_size() as u64;
        self.cache
            .get_or_read_page(locator, page, self.read_backend(locator, page * size, size))
            .await
            .map_err(StorageError::Shared)
    }

    /// Read `length` bytes at `offset` through the page tier. Like the
    /// backend, reads past the end of the blob are clamped.
    pub(crate) async fn read_range(
        &self,
        locator: &BlobLocator,
        offset: u64,
        length: u64,
    ) -> StorageResult<Bytes> {
        let size = self.cache.page_size() as u64;
        let end = offset.saturating_add(length);
        let pages = self.cache.pages_for(offset, length);

        if pages.end - pages.start == 1 {
            let data = self.read_page(locator, pages.start).await?;
            let start = pages.start * size;
            let from = ((offset - start) as usize).min(data.len());
            let to = ((end - start) as usize).min(data.len());
            return Ok(data.slice(from..to));
        }

        let mut out = BytesMut::with_capacity(length.min(64 * size) as usize);
        for page in pages {
            let data = self.read_page(locator, page).await?;
            let start = page * size;
            let from = (offset.max(start) - start) as usize;
            let to = ((end.min(start + size) - start) as usize).min(data.len());
            if from < to {
                out.extend_from_slice(&data[from..to]);
            }
            if (data.len() as u64) < size {
                break;
            }
        }
        Ok(out.freeze())
    }

    async fn load_header(&self, locator: &BlobLocator) -> StorageResult<CachedHeader> {
        let prefix_size = self.config.header_read_size.max(BundleSignature::SIZE) as u64;
        let prefix = self.read_range(locator, 0, prefix_size).await?;
        let required = BundleHeader::required_length(&prefix)?;

        let data = if required > prefix.len() && prefix.len() as u64 == prefix_size {
            let rest = self
                .read_range(locator, prefix_size, (required - prefix.len()) as u64)
                .await?;
            let mut joined = BytesMut::with_capacity(required);
            joined.extend_from_slice(&prefix);
            joined.extend_from_slice(&rest);
            joined.freeze()
        } else {
            prefix
        };

        let header = BundleHeader::read(&data)?;
        Ok(CachedHeader::new(header, required))
    }

    /// Parsed header of a bundle, through the header tier.
    pub(crate) async fn header(&self, locator: &BlobLocator) -> StorageResult<CachedHeader> {
        self.cache
            .get_or_read_header(locator, self.load_header(locator))
            .await
            .map_err(StorageError::Shared)
    }

    /// Seed the header tier with a header this client just wrote.
    pub(crate) async fn prime_header(&self, locator: &BlobLocator, header: BundleHeader, length: usize) {
        let cached = CachedHeader::new(header, length);
        let _ = self
            .cache
            .get_or_read_header(locator, async move { Ok::<_, StorageError>(cached) })
            .await;
    }

    /// Reader for a bundle, through the reader tier.
    pub(crate) async fn reader(&self, locator: &BlobLocator) -> StorageResult<Arc<BundleReader>> {
        let base = locator.base();
        self.cache
            .get_or_create_reader(&base, async {
                let cached = self.header(&base).await?;
                Ok::<_, StorageError>(Arc::new(BundleReader::new(base.clone(), cached)))
            })
            .await
            .map_err(StorageError::Shared)
    }

    async fn encoded_packet(&self, reader: &BundleReader, packet: u32) -> StorageResult<Bytes> {
        let key = PacketKey::new(reader.locator().clone(), packet, PacketForm::Encoded);
        self.cache
            .get_or_read_packet(key, async {
                let (offset, length) = reader.packet_range(packet)?;
                let data = self
                    .read_range(reader.locator(), offset, length as u64)
                    .await?;
                if data.len() != length as usize {
                    return Err(StorageError::from(BundleError::Truncated {
                        needed: length as usize,
                        available: data.len(),
                    }));
                }
                Ok::<_, StorageError>(data)
            })
            .await
            .map_err(StorageError::Shared)
    }

    pub(crate) async fn decoded_packet(&self, reader: &BundleReader, packet: u32) -> StorageResult<Bytes> {
        let key = PacketKey::new(reader.locator().clone(), packet, PacketForm::Decoded);
        self.cache
            .get_or_read_packet(key, async {
                let encoded = self.encoded_packet(reader, packet).await?;
                if reader.header().packets_in_place() {
                    return Ok(encoded);
                }
                let header = Arc::clone(reader.header());
                let decoded = tokio::task::spawn_blocking(move || {
                    header.decode_packet(packet as usize, &encoded)
                })
                .await
                .map_err(|e| StorageError::Internal(format!("packet decode task failed: {e}")))??;
                Ok::<_, StorageError>(Bytes::from(decoded))
            })
            .await
            .map_err(StorageError::Shared)
    }

    /// Bytes of an export, sliced from its decoded packet.
    pub(crate) async fn read_export(&self, location: &ExportLocation) -> StorageResult<Bytes> {
        let reader = self.reader(&location.bundle).await?;
        let packet = self.decoded_packet(&reader, location.packet).await?;
        let start = location.offset as usize;
        let end = start + location.length as usize;
        if end > packet.len() {
            return Err(BundleError::Truncated {
                needed: end,
                available: packet.len(),
            }
            .into());
        }
        Ok(packet.slice(start..end))
    }

    /// Mount a bundle: parse its header and reconcile node records for its
    /// imports and exports. Concurrent mounts of one bundle share one attempt,
    /// which leaves the table once it settles.
    pub(crate) async fn mount(self: &Arc<Self>, locator: &BlobLocator) -> StorageResult<()> {
        let base = locator.base();
        let pending = {
            let mut entry = self
                .mounts
                .entry(base.clone())
                .or_insert_with(|| self.start_mount(&base));
            if matches!(entry.value().peek(), Some(Err(_))) {
                *entry.value_mut() = self.start_mount(&base);
            }
            entry.value().clone()
        };
        let result = pending.clone().await;
        self.mounts.remove_if(&base, |_, current| current.ptr_eq(&pending));
        result.map_err(StorageError::Shared)
    }

    fn start_mount(self: &Arc<Self>, locator: &BlobLocator) -> MountFuture {
        let inner = Arc::clone(self);
        let locator = locator.clone();
        async move { inner.mount_now(&locator).await.map_err(Arc::new) }
            .boxed()
            .shared()
    }

    async fn mount_now(&self, locator: &BlobLocator) -> StorageResult<()> {
        let reader = self.reader(locator).await?;
        let exports = self
            .nodes
            .lock()
            .reconcile(locator, reader.header(), reader.header_length())?;
        debug!(
            bundle = %locator,
            exports = exports.len(),
            imports = reader.header().imports.len(),
            "mounted bundle"
        );
        Ok(())
    }

    /// Bytes and references of a node, mounting its bundle if needed.
    pub(crate) async fn read_node(self: &Arc<Self>, id: NodeId) -> StorageResult<NodeContent> {
        let mut mounted = false;
        loop {
            let (hash, references, state) = {
                let nodes = self.nodes.lock();
                let record = nodes.get(id)?;
                (record.hash, record.references.clone(), record.state.clone())
            };
            let data = match state {
                NodeState::InMemory { data, .. } | NodeState::Writing { data, .. } => data,
                NodeState::Exported(location) => self.read_export(&location).await?,
                NodeState::Imported {
                    bundle,
                    export,
                    packet,
                } => {
                    if mounted {
                        let fragment = match packet {
                            Some(packet) => format!("{packet}&{export}"),
                            None => export.to_string(),
                        };
                        return Err(StorageError::InvalidLocator(format!(
                            "{bundle} has no export matching #{fragment}"
                        )));
                    }
                    self.mount(&bundle).await?;
                    mounted = true;
                    continue;
                }
            };
            return Ok(NodeContent {
                hash,
                data,
                references,
            });
        }
    }
}
