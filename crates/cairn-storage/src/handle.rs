use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use cairn_backend::BlobStream;
use cairn_types::{BlobLocator, IoHash, LocatorFragment};

use crate::client::ClientInner;
use crate::config::WriterOptions;
use crate::error::{StorageError, StorageResult};
use crate::node::{ExportLocation, NodeArena, NodeId, NodeState};
use crate::writer::BundleWriter;

/// Attempts at flushing a node whose owner changes underneath us.
const FLUSH_ATTEMPTS: usize = 4;

/// What a [`BlobHandle`] points at.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandleTarget {
    /// A whole blob with no fragment.
    Blob(BlobLocator),
    /// `bundle#export`
    V1Export { bundle: BlobLocator, export: u32 },
    /// `bundle#packet&export`
    V2Export {
        bundle: BlobLocator,
        packet: u32,
        export: u32,
    },
    /// A node record of the owning client, stored or not.
    Node(NodeId),
}

/// Reference to a blob or node, bound to the client that created it.
#[derive(Clone)]
pub struct BlobHandle {
    client: Arc<ClientInner>,
    target: HandleTarget,
    hash: Option<IoHash>,
}

/// Bytes of a node together with handles to the nodes it references.
#[derive(Clone, Debug)]
pub struct NodeData {
    pub hash: IoHash,
    pub data: Bytes,
    pub references: Vec<BlobHandle>,
}

impl BlobHandle {
    pub(crate) fn new(client: Arc<ClientInner>, target: HandleTarget, hash: Option<IoHash>) -> Self {
        Self {
            client,
            target,
            hash,
        }
    }

    pub(crate) fn node(client: Arc<ClientInner>, id: NodeId) -> Self {
        Self::new(client, HandleTarget::Node(id), None)
    }

    /// Handle for a locator, dispatching on its fragment.
    pub(crate) fn from_locator(
        client: Arc<ClientInner>,
        locator: &BlobLocator,
        hash: Option<IoHash>,
    ) -> StorageResult<Self> {
        let fragment = locator
            .parse_fragment()
            .map_err(|e| StorageError::InvalidLocator(e.to_string()))?;
        let target = match fragment {
            None => HandleTarget::Blob(locator.clone()),
            Some(LocatorFragment::Export(export)) => HandleTarget::V1Export {
                bundle: locator.base(),
                export,
            },
            Some(LocatorFragment::PacketExport { packet, export }) => HandleTarget::V2Export {
                bundle: locator.base(),
                packet,
                export,
            },
        };
        Ok(Self::new(client, target, hash))
    }

    pub fn target(&self) -> &HandleTarget {
        &self.target
    }

    pub(crate) fn belongs_to(&self, client: &Arc<ClientInner>) -> bool {
        Arc::ptr_eq(&self.client, client)
    }

    /// Hash of the target, when known.
    pub fn hash(&self) -> Option<IoHash> {
        if self.hash.is_some() {
            return self.hash;
        }
        let nodes = self.client.nodes.lock();
        let id = match &self.target {
            HandleTarget::Node(id) => Some(*id),
            HandleTarget::V1Export { bundle, export }
            | HandleTarget::V2Export { bundle, export, .. } => nodes.find(bundle, *export),
            HandleTarget::Blob(_) => None,
        }?;
        nodes
            .get(id)
            .ok()
            .map(|record| record.hash)
            .filter(|hash| !hash.is_zero())
    }

    /// Node record behind the handle; `None` for raw blobs.
    pub(crate) fn resolve_in(&self, nodes: &mut NodeArena) -> StorageResult<Option<NodeId>> {
        let hash = self.hash.unwrap_or(IoHash::ZERO);
        match &self.target {
            HandleTarget::Blob(_) => Ok(None),
            HandleTarget::Node(id) => Ok(Some(*id)),
            HandleTarget::V1Export { bundle, export } => {
                nodes.import(bundle, *export, None, hash).map(Some)
            }
            HandleTarget::V2Export {
                bundle,
                packet,
                export,
            } => nodes.import(bundle, *export, Some(*packet), hash).map(Some),
        }
    }

    pub(crate) fn resolve(&self) -> StorageResult<Option<NodeId>> {
        let mut nodes = self.client.nodes.lock();
        self.resolve_in(&mut nodes)
    }

    /// Locator of the target. Fails for nodes that have not been written.
    pub fn try_locator(&self) -> StorageResult<BlobLocator> {
        match &self.target {
            HandleTarget::Blob(locator) => Ok(locator.clone()),
            HandleTarget::V1Export { bundle, export } => {
                Ok(bundle.with_fragment(LocatorFragment::Export(*export)))
            }
            HandleTarget::V2Export {
                bundle,
                packet,
                export,
            } => Ok(bundle.with_fragment(LocatorFragment::PacketExport {
                packet: *packet,
                export: *export,
            })),
            HandleTarget::Node(id) => {
                let nodes = self.client.nodes.lock();
                match &nodes.get(*id)?.state {
                    NodeState::Exported(location) => Ok(location.locator()),
                    NodeState::Imported {
                        bundle,
                        export,
                        packet: Some(packet),
                    } => Ok(bundle.with_fragment(LocatorFragment::PacketExport {
                        packet: *packet,
                        export: *export,
                    })),
                    NodeState::Imported {
                        bundle,
                        export,
                        packet: None,
                    } => Ok(bundle.with_fragment(LocatorFragment::Export(*export))),
                    NodeState::InMemory { .. } | NodeState::Writing { .. } => {
                        Err(StorageError::NotFlushed(*id))
                    }
                }
            }
        }
    }

    /// Where the node is stored, if it has been written or mounted.
    pub fn export_location(&self) -> Option<ExportLocation> {
        let HandleTarget::Node(id) = &self.target else {
            return None;
        };
        match &self.client.nodes.lock().get(*id).ok()?.state {
            NodeState::Exported(location) => Some(location.clone()),
            _ => None,
        }
    }

    /// Make sure the target is stored in the backend.
    ///
    /// A queued node is flushed by the writer that owns it; an unassigned
    /// node is written by a fresh writer with the client's defaults.
    pub async fn flush(&self) -> StorageResult<()> {
        let HandleTarget::Node(id) = self.target else {
            return Ok(());
        };
        for _ in 0..FLUSH_ATTEMPTS {
            let owner = {
                let nodes = self.client.nodes.lock();
                match &nodes.get(id)?.state {
                    NodeState::InMemory { owner, .. } => *owner,
                    NodeState::Writing { owner, .. } => Some(*owner),
                    NodeState::Imported { .. } | NodeState::Exported(_) => return Ok(()),
                }
            };
            match owner {
                Some(writer) => self.client.flush_writer(writer).await?,
                None => {
                    let writer = BundleWriter::create(&self.client, &WriterOptions::default())?;
                    writer.write_node(self).await?;
                    writer.flush().await?;
                }
            }
        }
        Err(StorageError::NotFlushed(id))
    }

    /// Read the node: its bytes and handles to its references. A raw blob
    /// reads as a node without references.
    pub async fn read_node(&self) -> StorageResult<NodeData> {
        let Some(id) = self.resolve()? else {
            let HandleTarget::Blob(locator) = &self.target else {
                return Err(StorageError::Internal("unresolved export handle".into()));
            };
            let data = self.client.read_blob(locator).await?;
            return Ok(NodeData {
                hash: self.hash.unwrap_or_else(|| IoHash::of(&data)),
                data,
                references: Vec::new(),
            });
        };

        let content = self.client.read_node(id).await?;
        Ok(NodeData {
            hash: content.hash,
            data: content.data,
            references: content
                .references
                .into_iter()
                .map(|reference| Self::node(Arc::clone(&self.client), reference))
                .collect(),
        })
    }

    /// Read `length` bytes at `offset`. Reads past the end are clamped.
    pub async fn read_range(&self, offset: u64, length: u64) -> StorageResult<Bytes> {
        if let HandleTarget::Blob(locator) = &self.target {
            return self.client.read_range(locator, offset, length).await;
        }
        let data = self.read_node().await?.data;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(length as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    /// Stream the target's bytes.
    pub async fn open(&self) -> StorageResult<BlobStream> {
        if let HandleTarget::Blob(locator) = &self.target {
            return self.client.open_blob(locator).await;
        }
        let data = self.read_node().await?.data;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }
}

impl PartialEq for BlobHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.client, &other.client) && self.target == other.target
    }
}

impl Eq for BlobHandle {}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobHandle")
            .field("target", &self.target)
            .field("hash", &self.hash)
            .finish()
    }
}
