use crate::error::{BundleError, BundleResult};
use crate::version::BundleVersion;

const LEGACY_MAGIC: &[u8; 4] = b"UEBN";
const MAGIC: &[u8; 3] = b"UBN";

/// Fixed 8-byte prelude of every bundle.
///
/// ```text
/// legacy:  "UEBN" [header_length: i32 BE]          (version Initial)
/// current: "UBN" [version: u8] [header_length: i32 LE]
/// ```
///
/// `header_length` counts the whole header including these 8 bytes, so the
/// packet payload starts at offset `header_length`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BundleSignature {
    pub version: BundleVersion,
    pub header_length: u32,
}

impl BundleSignature {
    pub const SIZE: usize = 8;

    pub fn new(version: BundleVersion, header_length: u32) -> Self {
        Self {
            version,
            header_length,
        }
    }

    /// Parse a signature from the first 8 bytes of `data`.
    pub fn read(data: &[u8]) -> BundleResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BundleError::Truncated {
                needed: Self::SIZE,
                available: data.len(),
            });
        }
        let length_bytes: [u8; 4] = [data[4], data[5], data[6], data[7]];

        let (version, raw_length) = if &data[0..4] == LEGACY_MAGIC {
            (BundleVersion::Initial, i32::from_be_bytes(length_bytes))
        } else if &data[0..3] == MAGIC {
            let version = BundleVersion::try_from(data[3])?;
            if version.uses_legacy_signature() {
                // Initial bundles are only ever written with the legacy magic.
                return Err(BundleError::InvalidSignature {
                    actual: String::from_utf8_lossy(&data[0..4]).into(),
                });
            }
            (version, i32::from_le_bytes(length_bytes))
        } else {
            return Err(BundleError::InvalidSignature {
                actual: String::from_utf8_lossy(&data[0..4]).into(),
            });
        };

        if raw_length < Self::SIZE as i32 {
            return Err(BundleError::InvalidHeader(format!(
                "header length {raw_length} is smaller than the signature"
            )));
        }
        Ok(Self::new(version, raw_length as u32))
    }

    /// Write the signature into the first 8 bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) -> BundleResult<()> {
        if buf.len() < Self::SIZE {
            return Err(BundleError::Truncated {
                needed: Self::SIZE,
                available: buf.len(),
            });
        }
        buf[..Self::SIZE].copy_from_slice(&self.to_bytes()?);
        Ok(())
    }

    pub fn to_bytes(&self) -> BundleResult<[u8; 8]> {
        let length = i32::try_from(self.header_length).map_err(|_| {
            BundleError::InvalidHeader(format!(
                "header length {} does not fit the signature",
                self.header_length
            ))
        })?;
        if length < Self::SIZE as i32 {
            return Err(BundleError::InvalidHeader(format!(
                "header length {length} is smaller than the signature"
            )));
        }

        let mut out = [0u8; 8];
        if self.version.uses_legacy_signature() {
            out[0..4].copy_from_slice(LEGACY_MAGIC);
            out[4..8].copy_from_slice(&length.to_be_bytes());
        } else {
            out[0..3].copy_from_slice(MAGIC);
            out[3] = self.version.as_u8();
            out[4..8].copy_from_slice(&length.to_le_bytes());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_signature_is_big_endian() {
        let sig = BundleSignature::new(BundleVersion::Initial, 0x0102_0304);
        let bytes = sig.to_bytes().unwrap();
        assert_eq!(&bytes, b"UEBN\x01\x02\x03\x04");
        assert_eq!(BundleSignature::read(&bytes).unwrap(), sig);
    }

    #[test]
    fn current_signature_is_little_endian() {
        let sig = BundleSignature::new(BundleVersion::PacketSequence, 0x0102_0304);
        let bytes = sig.to_bytes().unwrap();
        assert_eq!(&bytes, b"UBN\x05\x04\x03\x02\x01");
        assert_eq!(BundleSignature::read(&bytes).unwrap(), sig);
    }

    #[test]
    fn write_read_write_is_byte_exact() {
        for raw in 0..=5u8 {
            let version = BundleVersion::try_from(raw).unwrap();
            let sig = BundleSignature::new(version, 1234);
            let mut buf = [0u8; 12];
            sig.write(&mut buf).unwrap();
            let parsed = BundleSignature::read(&buf).unwrap();
            assert_eq!(parsed, sig);
            let mut again = [0u8; 12];
            parsed.write(&mut again).unwrap();
            assert_eq!(buf, again);
        }
    }

    #[test]
    fn bad_magic() {
        let err = BundleSignature::read(b"BADMAGIC").unwrap_err();
        assert!(matches!(err, BundleError::InvalidSignature { .. }));
        assert!(err.is_invalid_data());
    }

    #[test]
    fn unknown_version_byte() {
        let err = BundleSignature::read(b"UBN\x63\x08\x00\x00\x00").unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedVersion(0x63)));
    }

    #[test]
    fn initial_version_requires_legacy_magic() {
        let err = BundleSignature::read(b"UBN\x00\x08\x00\x00\x00").unwrap_err();
        assert!(matches!(err, BundleError::InvalidSignature { .. }));
    }

    #[test]
    fn header_length_must_cover_signature() {
        let err = BundleSignature::read(b"UBN\x05\x07\x00\x00\x00").unwrap_err();
        assert!(matches!(err, BundleError::InvalidHeader(_)));
        let err = BundleSignature::read(b"UEBN\xff\xff\xff\xff").unwrap_err();
        assert!(matches!(err, BundleError::InvalidHeader(_)));
        assert!(BundleSignature::new(BundleVersion::LATEST, 4)
            .to_bytes()
            .is_err());
    }

    #[test]
    fn too_short() {
        let err = BundleSignature::read(b"UBN").unwrap_err();
        assert!(matches!(err, BundleError::Truncated { needed: 8, available: 3 }));
        let mut small = [0u8; 4];
        assert!(BundleSignature::new(BundleVersion::LATEST, 8)
            .write(&mut small)
            .is_err());
    }
}
