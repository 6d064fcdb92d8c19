use tracing::trace;

use crate::compression::{compress, BundleCompressionFormat};
use crate::error::{BundleError, BundleResult};
use crate::header::{BundleHeader, BundlePacket};

/// Packs export payloads into independently compressed packets.
///
/// Exports are appended to an open packet until it holds at least
/// `min_packet_size` bytes; the next export then starts a new packet. An
/// export at least `min_packet_size` long arriving while the open packet is
/// empty is compressed straight from the caller's buffer as a packet of its
/// own. Exports never straddle packets, so readers of headers without
/// explicit placement can recover it by packing contiguously.
#[derive(Debug)]
pub struct PacketBuilder {
    format: BundleCompressionFormat,
    min_packet_size: usize,
    current: Vec<u8>,
    current_exports: usize,
    packets: Vec<BundlePacket>,
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// A `min_packet_size` of 0 is treated as 1 so empty exports never get
    /// a packet of their own.
    pub fn new(format: BundleCompressionFormat, min_packet_size: usize) -> Self {
        Self {
            format,
            min_packet_size: min_packet_size.max(1),
            current: Vec::new(),
            current_exports: 0,
            packets: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Append an export, returning its `(packet, offset)` placement.
    pub fn add_export(&mut self, data: &[u8]) -> BundleResult<(u32, u32)> {
        if self.current.len() >= self.min_packet_size {
            self.close_packet()?;
        }

        let packet = packet_index(self.packets.len())?;
        if self.current.is_empty() && !data.is_empty() && data.len() >= self.min_packet_size {
            // Zero-length exports already placed here sit at offset 0 of this packet.
            self.push_packet(data)?;
            self.current_exports = 0;
            return Ok((packet, 0));
        }

        let offset = u32::try_from(self.current.len())
            .map_err(|_| BundleError::InvalidHeader("packet exceeds 4 GiB".into()))?;
        self.current.extend_from_slice(data);
        self.current_exports += 1;
        Ok((packet, offset))
    }

    /// Number of packets closed so far.
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Close the open packet and return the packet table plus the
    /// concatenated compressed payload.
    pub fn finish(mut self) -> BundleResult<(Vec<BundlePacket>, Vec<u8>)> {
        self.close_packet()?;
        Ok((self.packets, self.payload))
    }

    fn close_packet(&mut self) -> BundleResult<()> {
        if self.current.is_empty() && self.current_exports == 0 {
            return Ok(());
        }
        let data = std::mem::take(&mut self.current);
        self.push_packet(&data)?;
        self.current_exports = 0;
        Ok(())
    }

    fn push_packet(&mut self, decoded: &[u8]) -> BundleResult<()> {
        let encoded = compress(self.format, decoded)?;
        let packet = BundlePacket {
            encoded_length: length_u32(encoded.len())?,
            decoded_length: length_u32(decoded.len())?,
        };
        trace!(
            packet = self.packets.len(),
            decoded = packet.decoded_length,
            encoded = packet.encoded_length,
            format = %self.format,
            "packet closed"
        );
        self.payload.extend_from_slice(&encoded);
        self.packets.push(packet);
        Ok(())
    }
}

fn packet_index(index: usize) -> BundleResult<u32> {
    u32::try_from(index).map_err(|_| BundleError::InvalidHeader("too many packets".into()))
}

fn length_u32(len: usize) -> BundleResult<u32> {
    u32::try_from(len).map_err(|_| BundleError::InvalidHeader(format!("packet of {len} bytes")))
}

/// Join an encoded header and its payload into one bundle blob.
pub fn assemble(header: &BundleHeader, payload: &[u8]) -> BundleResult<Vec<u8>> {
    if payload.len() as u64 != header.payload_length() {
        return Err(BundleError::LengthMismatch {
            expected: header.payload_length() as usize,
            actual: payload.len(),
        });
    }
    let mut out = header.write()?;
    out.extend_from_slice(payload);
    Ok(out)
}
