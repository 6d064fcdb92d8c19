//! Bundle file format for Cairn.
//!
//! A bundle is one immutable blob holding many small nodes:
//!
//! - **Signature** (8 bytes): magic, format version, header length
//! - **Header**: imported exports of other bundles, local exports with their
//!   reference lists, and the packet table
//! - **Payload**: the packets, each compressed independently
//!
//! Every version ever written stays readable. Versions up to
//! [`BundleVersion::LATEST_V1`] address exports as `locator#export`;
//! [`BundleVersion::PacketSequence`] adds explicit packet placement and
//! addresses exports as `locator#packet&export`.
//!
//! Everything here is a pure function of bytes. I/O lives in
//! `cairn-storage`.

pub mod compression;
pub mod error;
pub mod header;
pub mod packet;
pub mod signature;
mod varint;
pub mod version;

pub use compression::{compress, decompress, max_encoded_len, BundleCompressionFormat};
pub use error::{BundleError, BundleResult};
pub use header::{
    BundleExport, BundleHeader, BundleImport, BundlePacket, ImportedExport, ReferenceTarget,
};
pub use packet::{assemble, PacketBuilder};
pub use signature::BundleSignature;
pub use version::{BundleFormat, BundleVersion};

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::{BlobLocator, IoHash};

    fn node(i: usize, len: usize) -> Vec<u8> {
        (0..len).map(|j| ((i * 31 + j) % 251) as u8).collect()
    }

    /// Write a bundle of `count` exports, each referencing its predecessor.
    fn write_bundle(
        version: BundleVersion,
        compression: BundleCompressionFormat,
        count: usize,
        len: usize,
    ) -> (BundleHeader, Vec<u8>) {
        let mut builder = PacketBuilder::new(compression, 1024);
        let mut exports = Vec::new();
        for i in 0..count {
            let data = node(i, len);
            let (packet, offset) = builder.add_export(&data).unwrap();
            exports.push(BundleExport {
                hash: IoHash::of(&data),
                length: len as u32,
                packet,
                offset,
                references: if i == 0 { vec![0] } else { vec![i as u32] },
            });
        }
        let (packets, payload) = builder.finish().unwrap();
        let header = BundleHeader {
            version,
            compression,
            imports: vec![BundleImport {
                locator: BlobLocator::new("bundles/base"),
                export_count: 1,
                exports: vec![ImportedExport {
                    index: 0,
                    hash: if version.has_import_hashes() {
                        IoHash::of(b"base")
                    } else {
                        IoHash::ZERO
                    },
                }],
            }],
            exports,
            packets,
        };
        let blob = assemble(&header, &payload).unwrap();
        (header, blob)
    }

    fn read_export(blob: &[u8], index: usize) -> Vec<u8> {
        let header_length = BundleHeader::required_length(blob).unwrap();
        let header = BundleHeader::read(blob).unwrap();
        let export = &header.exports[index];
        let packet_start = header_length + header.packet_offsets()[export.packet as usize] as usize;
        let packet = &header.packets[export.packet as usize];
        let encoded = &blob[packet_start..packet_start + packet.encoded_length as usize];
        let decoded = header.decode_packet(export.packet as usize, encoded).unwrap();
        decoded[export.offset as usize..(export.offset + export.length) as usize].to_vec()
    }

    #[test]
    fn bundle_roundtrip_all_formats_and_versions() {
        for version in [BundleVersion::Initial, BundleVersion::LATEST_V1, BundleVersion::LATEST_V2] {
            for compression in BundleCompressionFormat::SUPPORTED {
                let (header, blob) = write_bundle(version, compression, 20, 300);
                assert!(header.packets.len() > 1, "{version} {compression}");
                for i in [0, 7, 19] {
                    assert_eq!(read_export(&blob, i), node(i, 300), "{version} {compression}");
                }
                let parsed = BundleHeader::read(&blob).unwrap();
                assert_eq!(parsed, header);
                assert_eq!(parsed.import_locators(), vec![BlobLocator::new("bundles/base")]);
            }
        }
    }

    #[test]
    fn corrupt_packet_is_detected() {
        let (header, blob) = write_bundle(BundleVersion::LATEST, BundleCompressionFormat::Lz4, 4, 600);
        let header_length = BundleHeader::required_length(&blob).unwrap();
        let encoded = &blob[header_length..header_length + header.packets[0].encoded_length as usize];
        let err = header
            .decode_packet(0, &encoded[..encoded.len() - 1])
            .unwrap_err();
        assert!(err.is_invalid_data());
    }

    #[test]
    fn in_place_packets() {
        let (header, _) = write_bundle(BundleVersion::LATEST, BundleCompressionFormat::None, 2, 10);
        assert!(header.packets_in_place());
        let (header, _) = write_bundle(BundleVersion::RemoveAliases, BundleCompressionFormat::None, 2, 10);
        assert!(!header.packets_in_place());
        let (header, _) = write_bundle(BundleVersion::LATEST, BundleCompressionFormat::Lz4, 2, 10);
        assert!(!header.packets_in_place());
    }
}
