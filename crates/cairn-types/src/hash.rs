use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content hash identifying a node.
///
/// An `IoHash` is a 32-byte BLAKE3 digest. Node identities are computed with
/// [`NodeHasher`], which folds the ordered reference hashes into the digest so
/// two nodes with equal bytes but different references never collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct IoHash([u8; 32]);

impl IoHash {
    /// Size of the hash on the wire.
    pub const LEN: usize = 32;

    /// The zero hash. Used for imports recorded by bundle versions that did
    /// not store hashes.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hash raw bytes without domain separation.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap a pre-computed digest.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Read a hash from the first 32 bytes of `data`.
    pub fn from_slice(data: &[u8]) -> Result<Self, TypeError> {
        let bytes: [u8; 32] = data
            .get(..Self::LEN)
            .and_then(|s| s.try_into().ok())
            .ok_or(TypeError::InvalidLength {
                expected: Self::LEN,
                actual: data.len(),
            })?;
        Ok(Self(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes).and_then(|hash| {
            if bytes.len() == Self::LEN {
                Ok(hash)
            } else {
                Err(TypeError::InvalidLength {
                    expected: Self::LEN,
                    actual: bytes.len(),
                })
            }
        })
    }
}

impl fmt::Debug for IoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoHash({})", self.short_hex())
    }
}

impl fmt::Display for IoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for IoHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Domain-separated BLAKE3 hasher for node identities.
///
/// The domain tag is prepended to every computation so a node hash can never
/// equal the plain hash of the same bytes.
pub struct NodeHasher {
    domain: &'static str,
}

impl NodeHasher {
    /// Hasher used for every node written through the storage client.
    pub const NODE: Self = Self {
        domain: "cairn-node-v1",
    };

    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash a node payload together with the ordered hashes of its references.
    pub fn hash_node(&self, data: &[u8], references: &[IoHash]) -> IoHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(&(data.len() as u64).to_le_bytes());
        hasher.update(data);
        hasher.update(&(references.len() as u64).to_le_bytes());
        for reference in references {
            hasher.update(reference.as_bytes());
        }
        IoHash(*hasher.finalize().as_bytes())
    }

    pub fn domain(&self) -> &str {
        self.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn of_is_deterministic() {
        assert_eq!(IoHash::of(b"hello"), IoHash::of(b"hello"));
        assert_ne!(IoHash::of(b"hello"), IoHash::of(b"world"));
    }

    #[test]
    fn zero_is_all_zeros() {
        assert!(IoHash::ZERO.is_zero());
        assert!(!IoHash::of(b"x").is_zero());
        assert_eq!(IoHash::default(), IoHash::ZERO);
    }

    #[test]
    fn hex_roundtrip() {
        let hash = IoHash::of(b"test");
        let parsed = IoHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(format!("{hash}"), hash.to_hex());
        assert_eq!(hash.short_hex().len(), 8);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let err = IoHash::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 32,
                actual: 2
            }
        );
        let long = format!("{}00", IoHash::of(b"x").to_hex());
        assert!(IoHash::from_hex(&long).is_err());
        assert!(matches!(
            IoHash::from_hex("zz"),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn from_slice_takes_prefix() {
        let hash = IoHash::of(b"prefix");
        let mut buf = hash.as_bytes().to_vec();
        buf.extend_from_slice(b"trailing");
        assert_eq!(IoHash::from_slice(&buf).unwrap(), hash);
        assert!(IoHash::from_slice(&buf[..10]).is_err());
    }

    #[test]
    fn node_hash_depends_on_references() {
        let a = IoHash::of(b"a");
        let b = IoHash::of(b"b");
        let h1 = NodeHasher::NODE.hash_node(b"data", &[a, b]);
        let h2 = NodeHasher::NODE.hash_node(b"data", &[a, b]);
        let h3 = NodeHasher::NODE.hash_node(b"data", &[b, a]);
        let h4 = NodeHasher::NODE.hash_node(b"data", &[a]);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_ne!(h1, h4);
    }

    #[test]
    fn node_hash_is_domain_separated() {
        let plain = IoHash::of(b"data");
        let node = NodeHasher::NODE.hash_node(b"data", &[]);
        let custom = NodeHasher::new("other-v1").hash_node(b"data", &[]);
        assert_ne!(plain, node);
        assert_ne!(node, custom);
    }

    #[test]
    fn serde_roundtrip() {
        let hash = IoHash::of(b"serde");
        let json = serde_json::to_string(&hash).unwrap();
        let parsed: IoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, parsed);
    }
}
