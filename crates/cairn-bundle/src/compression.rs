//! Packet compression codecs.
//!
//! Every packet of a bundle is compressed independently with the bundle's
//! [`BundleCompressionFormat`]. Both directions are pure functions of the
//! format and the input bytes. Decompression is strict: a codec error or a
//! decoded length different from the expected one is always an error.
//!
//! An empty input encodes to zero bytes in every format.

use std::fmt;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{BundleError, BundleResult};

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW_BITS: u32 = 22;
const ZSTD_LEVEL: i32 = 3;

/// Codec used for the packets of a bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BundleCompressionFormat {
    None = 0,
    Lz4 = 1,
    Gzip = 2,
    /// Proprietary codec. Recognised on the wire, but no implementation is
    /// available, so packets using it cannot be encoded or decoded.
    Oodle = 3,
    Brotli = 4,
    Zstd = 5,
}

impl BundleCompressionFormat {
    /// Formats this build can encode and decode.
    pub const SUPPORTED: [Self; 5] = [Self::None, Self::Lz4, Self::Gzip, Self::Brotli, Self::Zstd];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_supported(self) -> bool {
        self != Self::Oodle
    }

    pub fn compress(self, input: &[u8]) -> BundleResult<Vec<u8>> {
        compress(self, input)
    }

    pub fn decompress(self, input: &[u8], expected_len: usize) -> BundleResult<Vec<u8>> {
        decompress(self, input, expected_len)
    }

    pub fn max_encoded_len(self, len: usize) -> usize {
        max_encoded_len(self, len)
    }
}

impl TryFrom<u8> for BundleCompressionFormat {
    type Error = BundleError;

    fn try_from(value: u8) -> BundleResult<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Gzip),
            3 => Ok(Self::Oodle),
            4 => Ok(Self::Brotli),
            5 => Ok(Self::Zstd),
            other => Err(BundleError::UnknownCompression(other)),
        }
    }
}

impl fmt::Display for BundleCompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Gzip => "gzip",
            Self::Oodle => "oodle",
            Self::Brotli => "brotli",
            Self::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// Compress `input` with `format`.
pub fn compress(format: BundleCompressionFormat, input: &[u8]) -> BundleResult<Vec<u8>> {
    if input.is_empty() {
        return match format {
            BundleCompressionFormat::Oodle => Err(BundleError::UnsupportedCompression(format)),
            _ => Ok(Vec::new()),
        };
    }

    let failed = |e: std::io::Error| BundleError::CompressionFailed {
        format,
        reason: e.to_string(),
    };

    match format {
        BundleCompressionFormat::None => Ok(input.to_vec()),
        BundleCompressionFormat::Lz4 => Ok(lz4_flex::block::compress(input)),
        BundleCompressionFormat::Gzip => {
            let out = Vec::with_capacity(max_encoded_len(format, input.len()));
            let mut encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
            encoder.write_all(input).map_err(failed)?;
            encoder.finish().map_err(failed)
        }
        BundleCompressionFormat::Brotli => {
            let out = Vec::with_capacity(max_encoded_len(format, input.len()));
            let mut encoder = brotli::CompressorWriter::new(
                out,
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_WINDOW_BITS,
            );
            encoder.write_all(input).map_err(failed)?;
            Ok(encoder.into_inner())
        }
        BundleCompressionFormat::Zstd => zstd::bulk::compress(input, ZSTD_LEVEL).map_err(failed),
        BundleCompressionFormat::Oodle => Err(BundleError::UnsupportedCompression(format)),
    }
}

/// Decompress `input`, which must decode to exactly `expected_len` bytes.
pub fn decompress(
    format: BundleCompressionFormat,
    input: &[u8],
    expected_len: usize,
) -> BundleResult<Vec<u8>> {
    if format == BundleCompressionFormat::Oodle {
        return Err(BundleError::UnsupportedCompression(format));
    }
    if input.is_empty() {
        return match expected_len {
            0 => Ok(Vec::new()),
            expected => Err(BundleError::LengthMismatch {
                expected,
                actual: 0,
            }),
        };
    }

    let failed = |reason: String| BundleError::DecompressionFailed { format, reason };
    // Streaming decoders are capped one byte past the expected length so an
    // oversized stream is reported as a mismatch instead of being buffered.
    let limit = expected_len as u64 + 1;

    let output = match format {
        BundleCompressionFormat::None => input.to_vec(),
        BundleCompressionFormat::Lz4 => {
            lz4_flex::block::decompress(input, expected_len).map_err(|e| failed(e.to_string()))?
        }
        BundleCompressionFormat::Gzip => {
            let mut out = Vec::with_capacity(expected_len);
            flate2::read::GzDecoder::new(input)
                .take(limit)
                .read_to_end(&mut out)
                .map_err(|e| failed(e.to_string()))?;
            out
        }
        BundleCompressionFormat::Brotli => {
            let mut out = Vec::with_capacity(expected_len);
            brotli::Decompressor::new(input, BROTLI_BUFFER_SIZE)
                .take(limit)
                .read_to_end(&mut out)
                .map_err(|e| failed(e.to_string()))?;
            out
        }
        BundleCompressionFormat::Zstd => {
            zstd::bulk::decompress(input, expected_len).map_err(|e| failed(e.to_string()))?
        }
        BundleCompressionFormat::Oodle => return Err(BundleError::UnsupportedCompression(format)),
    };

    if output.len() != expected_len {
        return Err(BundleError::LengthMismatch {
            expected: expected_len,
            actual: output.len(),
        });
    }
    Ok(output)
}

/// Worst-case encoded size of `len` input bytes, for pre-sizing buffers.
pub fn max_encoded_len(format: BundleCompressionFormat, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    match format {
        BundleCompressionFormat::None => len,
        BundleCompressionFormat::Lz4 => lz4_flex::block::get_maximum_output_size(len),
        // Stored deflate blocks cost 5 bytes per 16 KiB, plus gzip framing.
        BundleCompressionFormat::Gzip => len + 5 * (len / 16_383 + 1) + 18,
        BundleCompressionFormat::Oodle => len + 274 * len.div_ceil(0x40000),
        BundleCompressionFormat::Brotli => len + 4 * (len >> 14) + 6,
        BundleCompressionFormat::Zstd => {
            let small = if len < 128 * 1024 {
                (128 * 1024 - len) >> 11
            } else {
                0
            };
            len + (len >> 8) + small
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKET_THRESHOLD: usize = 64 * 1024;

    fn sample(len: usize) -> Vec<u8> {
        // Compressible but not constant.
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|i| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                if i % 7 == 0 {
                    (state & 0xFF) as u8
                } else {
                    b'a' + (i % 13) as u8
                }
            })
            .collect()
    }

    #[test]
    fn roundtrip_all_supported_formats() {
        let lengths = [
            0,
            1,
            PACKET_THRESHOLD - 1,
            PACKET_THRESHOLD,
            PACKET_THRESHOLD + 1,
            10 * 1024 * 1024,
        ];
        for format in BundleCompressionFormat::SUPPORTED {
            for len in lengths {
                let data = sample(len);
                let encoded = compress(format, &data).unwrap();
                let decoded = decompress(format, &encoded, len).unwrap();
                assert!(decoded == data, "{format} roundtrip failed at {len} bytes");
            }
        }
    }

    #[test]
    fn truncated_packets_are_rejected() {
        let data = sample(PACKET_THRESHOLD + 1);
        for format in BundleCompressionFormat::SUPPORTED {
            let encoded = compress(format, &data).unwrap();
            let truncated = &encoded[..encoded.len() - 1];
            let err = decompress(format, truncated, data.len()).unwrap_err();
            assert!(err.is_invalid_data(), "{format}: {err}");
        }
    }

    #[test]
    fn wrong_expected_length_is_rejected() {
        let data = sample(1000);
        for format in BundleCompressionFormat::SUPPORTED {
            let encoded = compress(format, &data).unwrap();
            assert!(decompress(format, &encoded, 999).is_err(), "{format} short");
            assert!(decompress(format, &encoded, 1001).is_err(), "{format} long");
        }
    }

    #[test]
    fn none_is_a_copy() {
        let data = sample(100);
        assert_eq!(compress(BundleCompressionFormat::None, &data).unwrap(), data);
    }

    #[test]
    fn oodle_is_unsupported() {
        let err = compress(BundleCompressionFormat::Oodle, b"data").unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedCompression(_)));
        let err = decompress(BundleCompressionFormat::Oodle, b"data", 4).unwrap_err();
        assert!(err.is_invalid_data());
        assert!(!BundleCompressionFormat::Oodle.is_supported());
    }

    #[test]
    fn unknown_format_byte() {
        assert!(matches!(
            BundleCompressionFormat::try_from(9),
            Err(BundleError::UnknownCompression(9))
        ));
        for raw in 0..=5u8 {
            assert_eq!(BundleCompressionFormat::try_from(raw).unwrap().as_u8(), raw);
        }
    }

    #[test]
    fn encoded_size_is_bounded() {
        let data = sample(200_000);
        for format in BundleCompressionFormat::SUPPORTED {
            let encoded = compress(format, &data).unwrap();
            assert!(
                encoded.len() <= max_encoded_len(format, data.len()),
                "{format} exceeded its bound"
            );
        }
        assert_eq!(max_encoded_len(BundleCompressionFormat::Lz4, 0), 0);
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&BundleCompressionFormat::Lz4).unwrap();
        assert_eq!(json, "\"lz4\"");
        let parsed: BundleCompressionFormat = serde_json::from_str("\"brotli\"").unwrap();
        assert_eq!(parsed, BundleCompressionFormat::Brotli);
    }
}
