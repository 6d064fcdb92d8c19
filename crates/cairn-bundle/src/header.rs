//! Bundle header model and its bit-exact encoding.
//!
//! Layout after the 8-byte [`BundleSignature`] (all integers are LEB128
//! varints, strings are a varint length followed by UTF-8):
//!
//! ```text
//! compression
//! import_count
//!   { locator export_count n { export_index [hash:32 if >= ImportHashes] } }
//! export_count
//!   { hash:32 length [alias if == ExportAliases]
//!     [packet offset if >= PacketSequence] ref_count { ref } }
//! packet_count
//!   { encoded_length decoded_length }
//! ```

use cairn_types::{BlobLocator, IoHash};

use crate::compression::BundleCompressionFormat;
use crate::error::{BundleError, BundleResult};
use crate::signature::BundleSignature;
use crate::varint::{get_varint, put_varint};
use crate::version::{BundleFormat, BundleVersion};

/// Exports of another bundle referenced by this one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleImport {
    pub locator: BlobLocator,
    /// Total number of exports in the imported bundle.
    pub export_count: u32,
    pub exports: Vec<ImportedExport>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportedExport {
    pub index: u32,
    /// Zero for headers older than [`BundleVersion::ImportHashes`].
    pub hash: IoHash,
}

/// A node stored in this bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleExport {
    pub hash: IoHash,
    pub length: u32,
    pub packet: u32,
    /// Byte offset within the decoded packet.
    pub offset: u32,
    /// Indices into the flattened imports followed by the preceding exports.
    pub references: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundlePacket {
    pub encoded_length: u32,
    pub decoded_length: u32,
}

/// What a reference index of an export points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceTarget {
    Import { import: usize, entry: usize },
    Export(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleHeader {
    pub version: BundleVersion,
    pub compression: BundleCompressionFormat,
    pub imports: Vec<BundleImport>,
    pub exports: Vec<BundleExport>,
    pub packets: Vec<BundlePacket>,
}

impl BundleHeader {
    pub fn format(&self) -> BundleFormat {
        self.version.format()
    }

    /// Full header length (signature included) announced by a prefix of a
    /// bundle. Needs at least [`BundleSignature::SIZE`] bytes.
    pub fn required_length(prefix: &[u8]) -> BundleResult<usize> {
        Ok(BundleSignature::read(prefix)?.header_length as usize)
    }

    /// Decode a header from the start of `data`. Bytes past the announced
    /// header length (the packet payload) are ignored.
    pub fn read(data: &[u8]) -> BundleResult<Self> {
        let signature = BundleSignature::read(data)?;
        let header_length = signature.header_length as usize;
        if data.len() < header_length {
            return Err(BundleError::Truncated {
                needed: header_length,
                available: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[BundleSignature::SIZE..header_length]);
        let header = Self::read_body(signature.version, &mut cursor)?;
        if !cursor.is_empty() {
            return Err(BundleError::InvalidHeader(format!(
                "{} trailing bytes after packet table",
                cursor.remaining()
            )));
        }
        Ok(header)
    }

    fn read_body(version: BundleVersion, cursor: &mut Cursor<'_>) -> BundleResult<Self> {
        let compression = BundleCompressionFormat::try_from(cursor.read_u8_varint()?)?;

        let import_count = cursor.read_count()?;
        let mut imports = Vec::with_capacity(import_count);
        for _ in 0..import_count {
            let locator = BlobLocator::new(cursor.read_string()?);
            let export_count = cursor.read_u32()?;
            let n = cursor.read_count()?;
            let mut exports = Vec::with_capacity(n);
            for _ in 0..n {
                let index = cursor.read_u32()?;
                if index >= export_count {
                    return Err(BundleError::InvalidHeader(format!(
                        "import of {locator} references export {index} of {export_count}"
                    )));
                }
                let hash = if version.has_import_hashes() {
                    cursor.read_hash()?
                } else {
                    IoHash::ZERO
                };
                exports.push(ImportedExport { index, hash });
            }
            imports.push(BundleImport {
                locator,
                export_count,
                exports,
            });
        }

        let export_count = cursor.read_count()?;
        let mut exports = Vec::with_capacity(export_count);
        for _ in 0..export_count {
            let hash = cursor.read_hash()?;
            let length = cursor.read_u32()?;
            if version.has_export_aliases() {
                // Aliases moved to the backend; the per-export string is dropped.
                cursor.read_string()?;
            }
            let (packet, offset) = if version.has_export_placement() {
                (cursor.read_u32()?, cursor.read_u32()?)
            } else {
                (0, 0)
            };
            let ref_count = cursor.read_count()?;
            let mut references = Vec::with_capacity(ref_count);
            for _ in 0..ref_count {
                references.push(cursor.read_u32()?);
            }
            exports.push(BundleExport {
                hash,
                length,
                packet,
                offset,
                references,
            });
        }

        let packet_count = cursor.read_count()?;
        let mut packets = Vec::with_capacity(packet_count);
        for _ in 0..packet_count {
            packets.push(BundlePacket {
                encoded_length: cursor.read_u32()?,
                decoded_length: cursor.read_u32()?,
            });
        }

        let mut header = Self {
            version,
            compression,
            imports,
            exports,
            packets,
        };
        if !version.has_export_placement() {
            let layout = header.derive_layout()?;
            for (export, (packet, offset)) in header.exports.iter_mut().zip(layout) {
                export.packet = packet;
                export.offset = offset;
            }
        }
        header.validate()?;
        Ok(header)
    }

    /// Encode the header, signature included.
    pub fn write(&self) -> BundleResult<Vec<u8>> {
        self.validate()?;
        if !self.version.has_export_placement() {
            let layout = self.derive_layout()?;
            for (index, (export, placement)) in self.exports.iter().zip(layout).enumerate() {
                if (export.packet, export.offset) != placement {
                    return Err(BundleError::InvalidHeader(format!(
                        "export {index} at {}:{} is not contiguous for {}",
                        export.packet, export.offset, self.version
                    )));
                }
            }
        }

        let mut buf = vec![0u8; BundleSignature::SIZE];
        put_varint(&mut buf, self.compression.as_u8() as u64);

        put_varint(&mut buf, self.imports.len() as u64);
        for import in &self.imports {
            write_string(&mut buf, import.locator.as_str());
            put_varint(&mut buf, import.export_count as u64);
            put_varint(&mut buf, import.exports.len() as u64);
            for entry in &import.exports {
                put_varint(&mut buf, entry.index as u64);
                if self.version.has_import_hashes() {
                    buf.extend_from_slice(entry.hash.as_bytes());
                }
            }
        }

        put_varint(&mut buf, self.exports.len() as u64);
        for export in &self.exports {
            buf.extend_from_slice(export.hash.as_bytes());
            put_varint(&mut buf, export.length as u64);
            if self.version.has_export_aliases() {
                write_string(&mut buf, "");
            }
            if self.version.has_export_placement() {
                put_varint(&mut buf, export.packet as u64);
                put_varint(&mut buf, export.offset as u64);
            }
            put_varint(&mut buf, export.references.len() as u64);
            for &reference in &export.references {
                put_varint(&mut buf, reference as u64);
            }
        }

        put_varint(&mut buf, self.packets.len() as u64);
        for packet in &self.packets {
            put_varint(&mut buf, packet.encoded_length as u64);
            put_varint(&mut buf, packet.decoded_length as u64);
        }

        let header_length = u32::try_from(buf.len()).map_err(|_| {
            BundleError::InvalidHeader(format!("header of {} bytes is too large", buf.len()))
        })?;
        BundleSignature::new(self.version, header_length).write(&mut buf)?;
        Ok(buf)
    }

    /// Packet placement implied by contiguous packing, for headers that do
    /// not store it.
    fn derive_layout(&self) -> BundleResult<Vec<(u32, u32)>> {
        let mut layout = Vec::with_capacity(self.exports.len());
        let mut packet = 0usize;
        let mut offset = 0u64;
        for (index, export) in self.exports.iter().enumerate() {
            if self.packets.is_empty() {
                return Err(BundleError::InvalidHeader(format!(
                    "export {index} has no packet to live in"
                )));
            }
            while offset >= self.packets[packet].decoded_length as u64
                && packet + 1 < self.packets.len()
            {
                packet += 1;
                offset = 0;
            }
            let end = offset + export.length as u64;
            if end > self.packets[packet].decoded_length as u64 {
                return Err(BundleError::InvalidHeader(format!(
                    "export {index} straddles the end of packet {packet}"
                )));
            }
            layout.push((packet as u32, offset as u32));
            offset = end;
        }
        Ok(layout)
    }

    fn validate(&self) -> BundleResult<()> {
        let imported = self.imported_count();
        for import in &self.imports {
            if let Some(entry) = import.exports.iter().find(|e| e.index >= import.export_count) {
                return Err(BundleError::InvalidHeader(format!(
                    "import of {} references export {} of {}",
                    import.locator, entry.index, import.export_count
                )));
            }
        }
        for (index, export) in self.exports.iter().enumerate() {
            let limit = imported + index;
            if let Some(&reference) = export.references.iter().find(|&&r| r as usize >= limit) {
                return Err(BundleError::InvalidHeader(format!(
                    "export {index} has forward or out-of-range reference {reference}"
                )));
            }
            let packet = self.packets.get(export.packet as usize).ok_or_else(|| {
                BundleError::InvalidHeader(format!(
                    "export {index} is in missing packet {}",
                    export.packet
                ))
            })?;
            if export.offset as u64 + export.length as u64 > packet.decoded_length as u64 {
                return Err(BundleError::InvalidHeader(format!(
                    "export {index} overruns packet {}",
                    export.packet
                )));
            }
        }
        Ok(())
    }

    /// Number of entries across all imports.
    pub fn imported_count(&self) -> usize {
        self.imports.iter().map(|i| i.exports.len()).sum()
    }

    /// Resolve a reference index against `imports ++ exports`.
    pub fn reference_target(&self, reference: u32) -> Option<ReferenceTarget> {
        let mut index = reference as usize;
        for (import, entry) in self.imports.iter().enumerate() {
            if index < entry.exports.len() {
                return Some(ReferenceTarget::Import {
                    import,
                    entry: index,
                });
            }
            index -= entry.exports.len();
        }
        (index < self.exports.len()).then_some(ReferenceTarget::Export(index))
    }

    /// Distinct imported bundle locators, in first-seen order.
    pub fn import_locators(&self) -> Vec<BlobLocator> {
        let mut out: Vec<BlobLocator> = Vec::with_capacity(self.imports.len());
        for import in &self.imports {
            if !out.contains(&import.locator) {
                out.push(import.locator.clone());
            }
        }
        out
    }

    /// Offset of each packet relative to the start of the payload.
    pub fn packet_offsets(&self) -> Vec<u64> {
        let mut offset = 0u64;
        self.packets
            .iter()
            .map(|p| {
                let start = offset;
                offset += p.encoded_length as u64;
                start
            })
            .collect()
    }

    /// Total size of the compressed payload following the header.
    pub fn payload_length(&self) -> u64 {
        self.packets.iter().map(|p| p.encoded_length as u64).sum()
    }

    /// Decompress packet `index` from its encoded bytes.
    pub fn decode_packet(&self, index: usize, encoded: &[u8]) -> BundleResult<Vec<u8>> {
        let packet = self.packets.get(index).ok_or_else(|| {
            BundleError::InvalidHeader(format!("packet {index} of {}", self.packets.len()))
        })?;
        if encoded.len() != packet.encoded_length as usize {
            return Err(BundleError::LengthMismatch {
                expected: packet.encoded_length as usize,
                actual: encoded.len(),
            });
        }
        crate::compression::decompress(self.compression, encoded, packet.decoded_length as usize)
    }

    /// Whether packets can be served straight from their stored bytes.
    pub fn packets_in_place(&self) -> bool {
        self.compression == BundleCompressionFormat::None
            && self.version >= BundleVersion::InPlace
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    put_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn read_varint(&mut self) -> BundleResult<u64> {
        let (value, consumed) = get_varint(&self.data[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }

    fn read_u32(&mut self) -> BundleResult<u32> {
        let value = self.read_varint()?;
        u32::try_from(value)
            .map_err(|_| BundleError::InvalidHeader(format!("value {value} exceeds u32")))
    }

    fn read_u8_varint(&mut self) -> BundleResult<u8> {
        let value = self.read_varint()?;
        u8::try_from(value)
            .map_err(|_| BundleError::InvalidHeader(format!("value {value} exceeds u8")))
    }

    /// A count, capped by the bytes left so corrupt input cannot force a
    /// huge allocation.
    fn read_count(&mut self) -> BundleResult<usize> {
        let count = self.read_u32()? as usize;
        if count > self.remaining() {
            return Err(BundleError::Truncated {
                needed: count,
                available: self.remaining(),
            });
        }
        Ok(count)
    }

    fn take(&mut self, len: usize) -> BundleResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(BundleError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_hash(&mut self) -> BundleResult<IoHash> {
        let bytes = self.take(IoHash::LEN)?;
        let mut out = [0u8; IoHash::LEN];
        out.copy_from_slice(bytes);
        Ok(IoHash::from_bytes(out))
    }

    fn read_string(&mut self) -> BundleResult<String> {
        let len = self.read_count()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| BundleError::InvalidHeader(format!("invalid UTF-8 string: {e}")))
    }
}
