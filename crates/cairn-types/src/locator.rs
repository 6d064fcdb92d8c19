use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Opaque backend address of a blob.
///
/// A locator may carry a fragment after `#` selecting an export inside a
/// bundle. Two fragment forms exist:
///
/// - `bundle#<export>` -- export index, used by the V1 bundle formats
/// - `bundle#<packet>&<export>` -- packet and export index, used by V2
///
/// The backend only ever sees the base locator (everything before `#`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobLocator(String);

impl BlobLocator {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The locator without its fragment.
    pub fn base(&self) -> BlobLocator {
        match self.0.split_once('#') {
            Some((base, _)) => BlobLocator(base.to_string()),
            None => self.clone(),
        }
    }

    /// The raw fragment text, if any.
    pub fn fragment(&self) -> Option<&str> {
        self.0.split_once('#').map(|(_, fragment)| fragment)
    }

    pub fn has_fragment(&self) -> bool {
        self.0.contains('#')
    }

    /// Append a fragment to the base of this locator.
    pub fn with_fragment(&self, fragment: LocatorFragment) -> BlobLocator {
        BlobLocator(format!("{}#{}", self.base().0, fragment))
    }

    /// Parse the fragment, if present.
    ///
    /// Returns `Ok(None)` for a bare locator and an error for a fragment that
    /// matches neither supported form.
    pub fn parse_fragment(&self) -> Result<Option<LocatorFragment>, TypeError> {
        let Some(text) = self.fragment() else {
            return Ok(None);
        };
        let invalid = |reason: &str| TypeError::InvalidFragment {
            locator: self.0.clone(),
            reason: reason.to_string(),
        };

        let fragment = match text.split_once('&') {
            Some((packet, export)) => LocatorFragment::PacketExport {
                packet: parse_index(packet).ok_or_else(|| invalid("bad packet index"))?,
                export: parse_index(export).ok_or_else(|| invalid("bad export index"))?,
            },
            None => LocatorFragment::Export(
                parse_index(text).ok_or_else(|| invalid("bad export index"))?,
            ),
        };
        Ok(Some(fragment))
    }
}

fn parse_index(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

impl fmt::Debug for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobLocator({})", self.0)
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobLocator {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BlobLocator {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Parsed locator fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocatorFragment {
    /// `#<export>`: export index within a V1 bundle.
    Export(u32),
    /// `#<packet>&<export>`: packet and export index within a V2 bundle.
    PacketExport { packet: u32, export: u32 },
}

impl LocatorFragment {
    pub fn export(&self) -> u32 {
        match self {
            Self::Export(export) => *export,
            Self::PacketExport { export, .. } => *export,
        }
    }
}

impl fmt::Display for LocatorFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Export(export) => write!(f, "{export}"),
            Self::PacketExport { packet, export } => write!(f, "{packet}&{export}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_locator_has_no_fragment() {
        let loc = BlobLocator::new("bundles/abc");
        assert!(!loc.has_fragment());
        assert_eq!(loc.fragment(), None);
        assert_eq!(loc.parse_fragment().unwrap(), None);
        assert_eq!(loc.base(), loc);
    }

    #[test]
    fn parses_v1_fragment() {
        let loc = BlobLocator::new("bundles/abc#12");
        assert_eq!(loc.base().as_str(), "bundles/abc");
        assert_eq!(
            loc.parse_fragment().unwrap(),
            Some(LocatorFragment::Export(12))
        );
    }

    #[test]
    fn parses_v2_fragment() {
        let loc = BlobLocator::new("bundles/abc#3&7");
        let fragment = loc.parse_fragment().unwrap().unwrap();
        assert_eq!(
            fragment,
            LocatorFragment::PacketExport {
                packet: 3,
                export: 7
            }
        );
        assert_eq!(fragment.export(), 7);
    }

    #[test]
    fn with_fragment_replaces_existing() {
        let loc = BlobLocator::new("bundles/abc#1");
        let v2 = loc.with_fragment(LocatorFragment::PacketExport {
            packet: 0,
            export: 4,
        });
        assert_eq!(v2.as_str(), "bundles/abc#0&4");
        let v1 = v2.with_fragment(LocatorFragment::Export(9));
        assert_eq!(v1.as_str(), "bundles/abc#9");
    }

    #[test]
    fn rejects_malformed_fragments() {
        for bad in ["b#", "b#x", "b#-1", "b#+1", "b#1&", "b#&1", "b#1&2&3", "b#99999999999"] {
            let err = BlobLocator::new(bad).parse_fragment().unwrap_err();
            assert!(
                matches!(err, TypeError::InvalidFragment { .. }),
                "{bad} should be rejected"
            );
        }
    }
}
