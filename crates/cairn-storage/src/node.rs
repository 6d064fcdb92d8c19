//! Node records of one storage client.
//!
//! Every node the client knows about lives in a [`NodeArena`] slot addressed
//! by [`NodeId`]. Two side tables find existing records: one by node hash
//! (deduplicating identical content) and one by `(bundle, export)` location
//! (so every handle to a stored export shares a record).

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use cairn_bundle::{BundleFormat, BundleHeader};
use cairn_types::{BlobLocator, IoHash, NodeHasher};

use crate::error::{StorageError, StorageResult};

const UNMOUNTED: NodeHasher = NodeHasher::new("cairn-unmounted-export-v1");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriterId(pub(crate) u64);

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Where an exported node's bytes live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportLocation {
    pub bundle: BlobLocator,
    pub format: BundleFormat,
    pub export: u32,
    /// Number of exports in `bundle`.
    pub export_count: u32,
    pub packet: u32,
    /// Absolute offset of the encoded packet within the bundle blob.
    pub packet_offset: u64,
    pub packet_length: u32,
    /// Offset of the export within the decoded packet.
    pub offset: u32,
    pub length: u32,
    /// Publication order of `bundle` on this client; zero for bundles that
    /// were only mounted.
    pub sequence: u64,
}

impl ExportLocation {
    /// Locator of the export itself, with a fragment in the bundle's style.
    pub fn locator(&self) -> BlobLocator {
        self.bundle
            .with_fragment(self.format.fragment(self.packet, self.export))
    }

    /// Location of every export of a parsed header.
    pub fn for_header(
        bundle: &BlobLocator,
        header: &BundleHeader,
        header_length: usize,
        sequence: u64,
    ) -> StorageResult<Vec<Self>> {
        let offsets = header.packet_offsets();
        let export_count = count_u32(header.exports.len())?;
        header
            .exports
            .iter()
            .enumerate()
            .map(|(index, export)| {
                let packet = header.packets.get(export.packet as usize).ok_or_else(|| {
                    StorageError::Internal(format!("export {index} names a missing packet"))
                })?;
                Ok(Self {
                    bundle: bundle.clone(),
                    format: header.format(),
                    export: count_u32(index)?,
                    export_count,
                    packet: export.packet,
                    packet_offset: header_length as u64 + offsets[export.packet as usize],
                    packet_length: packet.encoded_length,
                    offset: export.offset,
                    length: export.length,
                    sequence,
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeState {
    InMemory {
        data: Bytes,
        owner: Option<WriterId>,
    },
    Writing {
        data: Bytes,
        owner: WriterId,
    },
    /// Known only by location; becomes `Exported` when the bundle is mounted.
    Imported {
        bundle: BlobLocator,
        export: u32,
        /// Packet named by a `#packet&export` locator, checked on mount.
        packet: Option<u32>,
    },
    Exported(ExportLocation),
}

#[derive(Clone, Debug)]
pub(crate) struct NodeRecord {
    /// Zero until known for imports of pre-hash bundle versions.
    pub hash: IoHash,
    /// Empty for `Imported` nodes until their bundle is mounted.
    pub references: Vec<NodeId>,
    pub state: NodeState,
}

impl NodeRecord {
    pub fn length(&self) -> u64 {
        match &self.state {
            NodeState::InMemory { data, .. } | NodeState::Writing { data, .. } => data.len() as u64,
            NodeState::Exported(location) => location.length as u64,
            NodeState::Imported { .. } => 0,
        }
    }

    /// Writer holding the node, if it is queued or being written.
    pub fn owner(&self) -> Option<WriterId> {
        match &self.state {
            NodeState::InMemory { owner, .. } => *owner,
            NodeState::Writing { owner, .. } => Some(*owner),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    records: Vec<NodeRecord>,
    by_hash: HashMap<IoHash, NodeId>,
    by_location: HashMap<(BlobLocator, u32), NodeId>,
}

impl NodeArena {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, id: NodeId) -> StorageResult<&NodeRecord> {
        self.records
            .get(id.index())
            .ok_or(StorageError::NodeNotFound(id))
    }

    fn get_mut(&mut self, id: NodeId) -> StorageResult<&mut NodeRecord> {
        self.records
            .get_mut(id.index())
            .ok_or(StorageError::NodeNotFound(id))
    }

    fn push(&mut self, record: NodeRecord) -> StorageResult<NodeId> {
        let id = NodeId(count_u32(self.records.len())?);
        if !record.hash.is_zero() {
            self.by_hash.entry(record.hash).or_insert(id);
        }
        if let NodeState::Imported { bundle, export, .. } = &record.state {
            self.by_location.insert((bundle.clone(), *export), id);
        }
        if let NodeState::Exported(location) = &record.state {
            self.by_location
                .insert((location.bundle.clone(), location.export), id);
        }
        self.records.push(record);
        Ok(id)
    }

    /// Add an unassigned in-memory node, or return the existing node with the
    /// same identity.
    pub fn insert(&mut self, data: Bytes, references: Vec<NodeId>) -> StorageResult<NodeId> {
        let hashes = references
            .iter()
            .map(|r| self.identity_of(*r))
            .collect::<StorageResult<Vec<_>>>()?;
        let hash = NodeHasher::NODE.hash_node(&data, &hashes);
        if let Some(&existing) = self.by_hash.get(&hash) {
            return Ok(existing);
        }
        self.push(NodeRecord {
            hash,
            references,
            state: NodeState::InMemory { data, owner: None },
        })
    }

    /// Hash a reference contributes to its parent's identity. An export
    /// whose hash is not known until its bundle is mounted stands in by
    /// location, so distinct unmounted exports never collide.
    fn identity_of(&self, id: NodeId) -> StorageResult<IoHash> {
        let record = self.get(id)?;
        match &record.state {
            NodeState::Imported { bundle, export, .. } if record.hash.is_zero() => {
                let location = format!("{}#{export}", bundle.base());
                Ok(UNMOUNTED.hash_node(location.as_bytes(), &[]))
            }
            _ => Ok(record.hash),
        }
    }

    pub fn find(&self, bundle: &BlobLocator, export: u32) -> Option<NodeId> {
        self.by_location.get(&(bundle.clone(), export)).copied()
    }

    /// Record for the export at `(bundle, export)`, created as `Imported` if
    /// the location is new.
    pub fn import(
        &mut self,
        bundle: &BlobLocator,
        export: u32,
        packet: Option<u32>,
        hash: IoHash,
    ) -> StorageResult<NodeId> {
        if let Some(id) = self.find(bundle, export) {
            return Ok(id);
        }
        self.push(NodeRecord {
            hash,
            references: Vec::new(),
            state: NodeState::Imported {
                bundle: bundle.clone(),
                export,
                packet,
            },
        })
    }

    /// Bring the records of a mounted bundle up to date: every import entry
    /// gets a record and every export becomes `Exported`.
    ///
    /// Nodes already exported elsewhere keep their location. An `Imported`
    /// record whose packet hint disagrees with the header is left as is.
    pub fn reconcile(
        &mut self,
        bundle: &BlobLocator,
        header: &BundleHeader,
        header_length: usize,
    ) -> StorageResult<Vec<NodeId>> {
        let mut targets = Vec::with_capacity(header.imported_count() + header.exports.len());
        for import in &header.imports {
            for entry in &import.exports {
                targets.push(self.import(&import.locator, entry.index, None, entry.hash)?);
            }
        }

        let locations = ExportLocation::for_header(bundle, header, header_length, 0)?;
        let mut exports = Vec::with_capacity(header.exports.len());
        for (export, location) in header.exports.iter().zip(locations) {
            let references = export
                .references
                .iter()
                .map(|r| {
                    targets.get(*r as usize).copied().ok_or_else(|| {
                        StorageError::Internal(format!("reference {r} out of range"))
                    })
                })
                .collect::<StorageResult<Vec<_>>>()?;
            let id = self.reconcile_export(export.hash, references, location)?;
            targets.push(id);
            exports.push(id);
        }
        Ok(exports)
    }

    fn reconcile_export(
        &mut self,
        hash: IoHash,
        references: Vec<NodeId>,
        location: ExportLocation,
    ) -> StorageResult<NodeId> {
        let key = (location.bundle.clone(), location.export);
        if let Some(&id) = self.by_location.get(&key) {
            let record = self.get_mut(id)?;
            if let NodeState::Imported { packet, .. } = &record.state {
                if packet.map_or(true, |p| p == location.packet) {
                    record.state = NodeState::Exported(location);
                    record.references = references;
                    if record.hash.is_zero() && !hash.is_zero() {
                        record.hash = hash;
                        self.by_hash.entry(hash).or_insert(id);
                    }
                }
            }
            return Ok(id);
        }

        // Unqueued content that turns out to be stored already needs no write.
        if let Some(&id) = self.by_hash.get(&hash) {
            let record = self.get_mut(id)?;
            if matches!(record.state, NodeState::InMemory { owner: None, .. }) {
                record.state = NodeState::Exported(location);
                self.by_location.insert(key, id);
                return Ok(id);
            }
        }

        self.push(NodeRecord {
            hash,
            references,
            state: NodeState::Exported(location),
        })
    }

    pub fn assign(&mut self, id: NodeId, writer: WriterId) -> StorageResult<()> {
        let record = self.get_mut(id)?;
        match &mut record.state {
            NodeState::InMemory { owner, .. } if owner.is_none() => {
                *owner = Some(writer);
                Ok(())
            }
            _ => Err(StorageError::Internal(format!("{id} is not unassigned"))),
        }
    }

    /// Give queued nodes of a dropped writer back to whoever writes them next.
    pub fn release(&mut self, id: NodeId, writer: WriterId) {
        if let Some(record) = self.records.get_mut(id.index()) {
            if let NodeState::InMemory { owner, .. } = &mut record.state {
                if *owner == Some(writer) {
                    *owner = None;
                }
            }
        }
    }

    pub fn start_writing(&mut self, id: NodeId, writer: WriterId) -> StorageResult<()> {
        let record = self.get_mut(id)?;
        match &record.state {
            NodeState::InMemory { data, owner } if *owner == Some(writer) => {
                record.state = NodeState::Writing {
                    data: data.clone(),
                    owner: writer,
                };
                Ok(())
            }
            _ => Err(StorageError::NotQueued { node: id, writer }),
        }
    }

    /// Return a node of a failed batch to its writer's queue state.
    pub fn abort_writing(&mut self, id: NodeId, writer: WriterId) {
        if let Some(record) = self.records.get_mut(id.index()) {
            if let NodeState::Writing { data, owner } = &record.state {
                if *owner == writer {
                    record.state = NodeState::InMemory {
                        data: data.clone(),
                        owner: Some(writer),
                    };
                }
            }
        }
    }

    /// Record a published location. A node rewritten into a newer bundle
    /// moves to that location.
    pub fn mark_exported(&mut self, id: NodeId, location: ExportLocation) -> StorageResult<()> {
        let key = (location.bundle.clone(), location.export);
        let record = self.get_mut(id)?;
        record.state = NodeState::Exported(location);
        self.by_location.insert(key, id);
        Ok(())
    }
}

fn count_u32(value: usize) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| StorageError::Internal(format!("{value} exceeds u32")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_bundle::{BundleCompressionFormat, BundleExport, BundleImport, BundlePacket};
    use cairn_bundle::{BundleVersion, ImportedExport};

    fn location(bundle: &str, export: u32, sequence: u64) -> ExportLocation {
        ExportLocation {
            bundle: BlobLocator::new(bundle),
            format: BundleFormat::V2,
            export,
            export_count: 1,
            packet: 0,
            packet_offset: 40,
            packet_length: 4,
            offset: 0,
            length: 4,
            sequence,
        }
    }

    #[test]
    fn identical_content_is_deduplicated() {
        let mut arena = NodeArena::default();
        let leaf = arena.insert(Bytes::from_static(b"leaf"), vec![]).unwrap();
        let again = arena.insert(Bytes::from_static(b"leaf"), vec![]).unwrap();
        assert_eq!(leaf, again);

        let parent = arena.insert(Bytes::from_static(b"p"), vec![leaf]).unwrap();
        let bare = arena.insert(Bytes::from_static(b"p"), vec![]).unwrap();
        assert_ne!(parent, bare);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let mut arena = NodeArena::default();
        let err = arena
            .insert(Bytes::from_static(b"x"), vec![NodeId(7)])
            .unwrap_err();
        assert!(matches!(err, StorageError::NodeNotFound(NodeId(7))));
    }

    #[test]
    fn unmounted_references_keep_parents_apart() {
        let mut arena = NodeArena::default();
        let bundle = BlobLocator::new("bundles/a");
        let left = arena.import(&bundle, 0, None, IoHash::ZERO).unwrap();
        let right = arena.import(&bundle, 1, None, IoHash::ZERO).unwrap();

        let via_left = arena.insert(Bytes::from_static(b"x"), vec![left]).unwrap();
        let via_right = arena.insert(Bytes::from_static(b"x"), vec![right]).unwrap();
        assert_ne!(via_left, via_right);
        assert_eq!(arena.get(via_right).unwrap().references, vec![right]);

        let again = arena.insert(Bytes::from_static(b"x"), vec![left]).unwrap();
        assert_eq!(again, via_left);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut arena = NodeArena::default();
        let writer = WriterId(1);
        let other = WriterId(2);
        let id = arena.insert(Bytes::from_static(b"data"), vec![]).unwrap();

        arena.assign(id, writer).unwrap();
        assert!(arena.assign(id, other).is_err());
        assert_eq!(arena.get(id).unwrap().owner(), Some(writer));

        assert!(matches!(
            arena.start_writing(id, other),
            Err(StorageError::NotQueued { .. })
        ));
        arena.start_writing(id, writer).unwrap();
        arena.abort_writing(id, writer);
        assert!(matches!(
            arena.get(id).unwrap().state,
            NodeState::InMemory { owner: Some(w), .. } if w == writer
        ));

        arena.start_writing(id, writer).unwrap();
        arena.mark_exported(id, location("b/1", 0, 1)).unwrap();
        assert_eq!(arena.get(id).unwrap().owner(), None);
        let same = arena
            .import(&BlobLocator::new("b/1"), 0, None, IoHash::ZERO)
            .unwrap();
        assert_eq!(same, id);
    }

    #[test]
    fn release_only_touches_own_nodes() {
        let mut arena = NodeArena::default();
        let a = arena.insert(Bytes::from_static(b"a"), vec![]).unwrap();
        let b = arena.insert(Bytes::from_static(b"b"), vec![]).unwrap();
        arena.assign(a, WriterId(1)).unwrap();
        arena.assign(b, WriterId(2)).unwrap();
        arena.release(a, WriterId(1));
        arena.release(b, WriterId(1));
        assert_eq!(arena.get(a).unwrap().owner(), None);
        assert_eq!(arena.get(b).unwrap().owner(), Some(WriterId(2)));
    }

    fn sample_header() -> BundleHeader {
        BundleHeader {
            version: BundleVersion::LATEST,
            compression: BundleCompressionFormat::None,
            imports: vec![BundleImport {
                locator: BlobLocator::new("other"),
                export_count: 3,
                exports: vec![ImportedExport {
                    index: 2,
                    hash: IoHash::of(b"imported"),
                }],
            }],
            exports: vec![
                BundleExport {
                    hash: IoHash::of(b"first"),
                    length: 2,
                    packet: 0,
                    offset: 0,
                    references: vec![0],
                },
                BundleExport {
                    hash: IoHash::of(b"second"),
                    length: 3,
                    packet: 0,
                    offset: 2,
                    references: vec![0, 1],
                },
            ],
            packets: vec![BundlePacket {
                encoded_length: 5,
                decoded_length: 5,
            }],
        }
    }

    #[test]
    fn reconcile_links_imports_and_exports() {
        let mut arena = NodeArena::default();
        let bundle = BlobLocator::new("mine");
        let pending = arena.import(&bundle, 1, None, IoHash::ZERO).unwrap();

        let exports = arena.reconcile(&bundle, &sample_header(), 100).unwrap();
        assert_eq!(exports.len(), 2);
        assert_eq!(exports[1], pending);

        let second = arena.get(pending).unwrap();
        assert_eq!(second.hash, IoHash::of(b"second"));
        assert_eq!(second.references.len(), 2);
        assert_eq!(second.references[1], exports[0]);
        let NodeState::Exported(location) = &second.state else {
            panic!("not exported: {:?}", second.state);
        };
        assert_eq!(location.offset, 2);
        assert_eq!(location.packet_offset, 100);
        assert_eq!(location.export_count, 2);
        assert_eq!(location.locator().as_str(), "mine#0&1");

        let imported = arena.get(second.references[0]).unwrap();
        assert!(matches!(
            &imported.state,
            NodeState::Imported { export: 2, .. }
        ));

        // Mounting again changes nothing.
        let before = arena.len();
        assert_eq!(arena.reconcile(&bundle, &sample_header(), 100).unwrap(), exports);
        assert_eq!(arena.len(), before);
    }

    #[test]
    fn reconcile_respects_packet_hint() {
        let mut arena = NodeArena::default();
        let bundle = BlobLocator::new("mine");
        let wrong = arena.import(&bundle, 0, Some(3), IoHash::ZERO).unwrap();
        arena.reconcile(&bundle, &sample_header(), 100).unwrap();
        assert!(matches!(
            arena.get(wrong).unwrap().state,
            NodeState::Imported { .. }
        ));
    }

    #[test]
    fn reconcile_adopts_unqueued_duplicate() {
        let mut arena = NodeArena::default();
        let local = arena.insert(Bytes::from_static(b"ab"), vec![]).unwrap();
        let mut header = sample_header();
        header.imports.clear();
        header.exports[0].hash = arena.get(local).unwrap().hash;
        header.exports[0].references.clear();
        header.exports[1].references = vec![0];

        let exports = arena
            .reconcile(&BlobLocator::new("mine"), &header, 8)
            .unwrap();
        assert_eq!(exports[0], local);
        assert!(matches!(
            arena.get(local).unwrap().state,
            NodeState::Exported(_)
        ));
    }

    proptest::proptest! {
        #[test]
        fn identity_follows_content_and_references(
            payloads in proptest::collection::vec(
                proptest::collection::vec(proptest::prelude::any::<u8>(), 0..32),
                1..16,
            )
        ) {
            let mut arena = NodeArena::default();
            let mut ids = Vec::new();
            for payload in &payloads {
                ids.push(arena.insert(Bytes::from(payload.clone()), vec![]).unwrap());
            }
            for (i, a) in payloads.iter().enumerate() {
                for (j, b) in payloads.iter().enumerate() {
                    proptest::prop_assert_eq!(a == b, ids[i] == ids[j]);
                }
            }

            let first = ids[0];
            let parent = arena.insert(Bytes::from(payloads[0].clone()), vec![first]).unwrap();
            proptest::prop_assert_ne!(parent, first);
            let again = arena.insert(Bytes::from(payloads[0].clone()), vec![first]).unwrap();
            proptest::prop_assert_eq!(parent, again);
        }
    }
}
