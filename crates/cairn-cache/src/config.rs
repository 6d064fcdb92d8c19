use serde::{Deserialize, Serialize};

/// Capacities of the cache tiers. A capacity of zero disables a tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of open bundle readers.
    pub reader_count: u64,
    /// Maximum number of cached pages.
    pub page_count: u64,
    /// Size of one page window in bytes.
    pub page_size: usize,
    /// Byte budget for decoded headers.
    pub header_bytes: u64,
    /// Byte budget for encoded and decoded packets.
    pub packet_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reader_count: 64,
            page_count: 256,
            page_size: 1024 * 1024,
            header_bytes: 16 * 1024 * 1024,
            packet_bytes: 256 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Every tier disabled.
    pub fn disabled() -> Self {
        Self {
            reader_count: 0,
            page_count: 0,
            header_bytes: 0,
            packet_bytes: 0,
            ..Self::default()
        }
    }
}
