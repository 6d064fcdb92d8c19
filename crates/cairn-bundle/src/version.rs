use std::fmt;

use cairn_types::LocatorFragment;
use serde::{Deserialize, Serialize};

use crate::error::{BundleError, BundleResult};

/// Bundle format revision. Every revision stays readable forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum BundleVersion {
    /// Legacy big-endian signature; imports carry no hashes.
    Initial = 0,
    /// Each export carries an alias string.
    ExportAliases = 1,
    /// Export aliases removed again.
    RemoveAliases = 2,
    /// Uncompressed packets may be served without copying.
    InPlace = 3,
    /// Imported exports carry their hash.
    ImportHashes = 4,
    /// Exports carry their explicit packet and offset.
    PacketSequence = 5,
}

impl BundleVersion {
    /// Newest version written by the V1 pipeline.
    pub const LATEST_V1: Self = Self::ImportHashes;
    /// Newest version written by the V2 pipeline.
    pub const LATEST_V2: Self = Self::PacketSequence;
    pub const LATEST: Self = Self::LATEST_V2;

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the legacy `UEBN` signature is used for this version.
    pub fn uses_legacy_signature(self) -> bool {
        self == Self::Initial
    }

    pub fn has_export_aliases(self) -> bool {
        self == Self::ExportAliases
    }

    pub fn has_import_hashes(self) -> bool {
        self >= Self::ImportHashes
    }

    /// Whether exports record their packet and offset explicitly.
    pub fn has_export_placement(self) -> bool {
        self >= Self::PacketSequence
    }

    /// The pipeline that reads and writes this version.
    pub fn format(self) -> BundleFormat {
        if self <= Self::LATEST_V1 {
            BundleFormat::V1(self)
        } else {
            BundleFormat::V2
        }
    }
}

impl TryFrom<u8> for BundleVersion {
    type Error = BundleError;

    fn try_from(value: u8) -> BundleResult<Self> {
        match value {
            0 => Ok(Self::Initial),
            1 => Ok(Self::ExportAliases),
            2 => Ok(Self::RemoveAliases),
            3 => Ok(Self::InPlace),
            4 => Ok(Self::ImportHashes),
            5 => Ok(Self::PacketSequence),
            other => Err(BundleError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for BundleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.as_u8())
    }
}

/// Which bundle pipeline a writer or handle uses.
///
/// Resolved once from a version; code downstream matches on the tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BundleFormat {
    /// Per-export addressing (`locator#export`), written at the given version.
    V1(BundleVersion),
    /// Per-packet addressing (`locator#packet&export`).
    V2,
}

impl BundleFormat {
    /// Select the pipeline for a configured maximum version.
    pub fn for_max_version(raw: u8) -> BundleResult<Self> {
        BundleVersion::try_from(raw).map(BundleVersion::format)
    }

    /// The version this pipeline writes.
    pub fn version(self) -> BundleVersion {
        match self {
            Self::V1(version) => version,
            Self::V2 => BundleVersion::LATEST_V2,
        }
    }

    /// Fragment addressing an export stored at `packet`.
    pub fn fragment(self, packet: u32, export: u32) -> LocatorFragment {
        match self {
            Self::V1(_) => LocatorFragment::Export(export),
            Self::V2 => LocatorFragment::PacketExport { packet, export },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_ordered() {
        assert!(BundleVersion::Initial < BundleVersion::ExportAliases);
        assert!(BundleVersion::ImportHashes < BundleVersion::PacketSequence);
        assert_eq!(BundleVersion::LATEST, BundleVersion::PacketSequence);
    }

    #[test]
    fn try_from_u8() {
        for raw in 0..=5u8 {
            assert_eq!(BundleVersion::try_from(raw).unwrap().as_u8(), raw);
        }
        assert!(matches!(
            BundleVersion::try_from(6),
            Err(BundleError::UnsupportedVersion(6))
        ));
    }

    #[test]
    fn format_selection() {
        assert_eq!(
            BundleFormat::for_max_version(0).unwrap(),
            BundleFormat::V1(BundleVersion::Initial)
        );
        assert_eq!(
            BundleFormat::for_max_version(4).unwrap(),
            BundleFormat::V1(BundleVersion::ImportHashes)
        );
        assert_eq!(BundleFormat::for_max_version(5).unwrap(), BundleFormat::V2);
        assert!(BundleFormat::for_max_version(42).is_err());
        assert_eq!(BundleFormat::V2.version(), BundleVersion::PacketSequence);
    }

    #[test]
    fn feature_flags() {
        assert!(BundleVersion::Initial.uses_legacy_signature());
        assert!(!BundleVersion::InPlace.has_import_hashes());
        assert!(BundleVersion::ImportHashes.has_import_hashes());
        assert!(BundleVersion::ExportAliases.has_export_aliases());
        assert!(!BundleVersion::RemoveAliases.has_export_aliases());
        assert!(BundleVersion::PacketSequence.has_export_placement());
        assert!(!BundleVersion::ImportHashes.has_export_placement());
    }

    #[test]
    fn fragments_follow_format() {
        let v1 = BundleFormat::V1(BundleVersion::ImportHashes);
        assert_eq!(v1.fragment(2, 7), LocatorFragment::Export(7));
        assert_eq!(
            BundleFormat::V2.fragment(2, 7),
            LocatorFragment::PacketExport {
                packet: 2,
                export: 7
            }
        );
    }
}
