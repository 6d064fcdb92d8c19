//! Encoding a batch of queued nodes into one bundle blob.

use std::collections::HashMap;

use bytes::Bytes;
use cairn_bundle::{
    assemble, BundleCompressionFormat, BundleExport, BundleFormat, BundleHeader, BundleImport,
    ImportedExport, PacketBuilder,
};
use cairn_types::{BlobLocator, IoHash};

use crate::error::{StorageError, StorageResult};

/// A reference from a batch node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BatchRef {
    /// An earlier node of the same batch.
    Local(usize),
    /// A node already stored in another bundle.
    External {
        bundle: BlobLocator,
        export: u32,
        export_count: u32,
        hash: IoHash,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct BatchNode {
    pub hash: IoHash,
    pub data: Bytes,
    pub references: Vec<BatchRef>,
}

#[derive(Debug)]
pub(crate) struct EncodedBatch {
    pub blob: Bytes,
    pub header: BundleHeader,
    pub header_length: usize,
    /// Distinct bundles the batch imports from.
    pub imports: Vec<BlobLocator>,
}

/// Lay out `nodes` as the exports of a single bundle.
///
/// Imports are grouped by source bundle in first-seen order, with one entry
/// per distinct source export.
pub(crate) fn encode_batch(
    nodes: &[BatchNode],
    format: BundleFormat,
    compression: BundleCompressionFormat,
    min_packet_size: usize,
) -> StorageResult<EncodedBatch> {
    let mut imports: Vec<BundleImport> = Vec::new();
    let mut import_index: HashMap<BlobLocator, usize> = HashMap::new();
    let mut entry_index: HashMap<(usize, u32), usize> = HashMap::new();

    for node in nodes {
        for reference in &node.references {
            let BatchRef::External {
                bundle,
                export,
                export_count,
                hash,
            } = reference
            else {
                continue;
            };
            let import = *import_index.entry(bundle.clone()).or_insert_with(|| {
                imports.push(BundleImport {
                    locator: bundle.clone(),
                    export_count: *export_count,
                    exports: Vec::new(),
                });
                imports.len() - 1
            });
            entry_index.entry((import, *export)).or_insert_with(|| {
                let entries = &mut imports[import].exports;
                entries.push(ImportedExport {
                    index: *export,
                    hash: *hash,
                });
                entries.len() - 1
            });
        }
    }

    let mut import_base = Vec::with_capacity(imports.len());
    let mut imported = 0usize;
    for import in &imports {
        import_base.push(imported);
        imported += import.exports.len();
    }

    let mut packets = PacketBuilder::new(compression, min_packet_size);
    let mut exports = Vec::with_capacity(nodes.len());
    for (position, node) in nodes.iter().enumerate() {
        let references = node
            .references
            .iter()
            .map(|reference| {
                let flat = match reference {
                    BatchRef::Local(index) if *index < position => imported + index,
                    BatchRef::Local(index) => {
                        return Err(StorageError::Internal(format!(
                            "batch node {position} references later node {index}"
                        )))
                    }
                    BatchRef::External { bundle, export, .. } => {
                        let import = import_index[bundle];
                        import_base[import] + entry_index[&(import, *export)]
                    }
                };
                u32::try_from(flat)
                    .map_err(|_| StorageError::Internal("reference index exceeds u32".into()))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        let (packet, offset) = packets.add_export(&node.data)?;
        exports.push(BundleExport {
            hash: node.hash,
            length: u32::try_from(node.data.len())
                .map_err(|_| StorageError::Internal("node exceeds 4 GiB".into()))?,
            packet,
            offset,
            references,
        });
    }

    let (packets, payload) = packets.finish()?;
    let header = BundleHeader {
        version: format.version(),
        compression,
        imports,
        exports,
        packets,
    };
    let blob = assemble(&header, &payload)?;
    let header_length = blob.len() - payload.len();
    let imports = header.import_locators();
    Ok(EncodedBatch {
        blob: Bytes::from(blob),
        header,
        header_length,
        imports,
    })
}
