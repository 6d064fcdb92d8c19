use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free request and miss counters for one tier.
#[derive(Debug, Default)]
pub(crate) struct TierCounters {
    requests: AtomicU64,
    misses: AtomicU64,
}

impl TierCounters {
    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entries: u64) -> TierStats {
        let requests = self.requests.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierStats {
            hits: requests.saturating_sub(misses),
            misses,
            entries,
        }
    }

    pub(crate) fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of one tier.
///
/// A miss is a request that ran the loader; callers that waited on another
/// caller's load count as hits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    /// Approximate number of resident entries.
    pub entries: u64,
}

impl TierStats {
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Snapshot of every tier of a [`crate::BundleCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub readers: TierStats,
    pub pages: TierStats,
    pub headers: TierStats,
    pub packets: TierStats,
}

impl CacheStats {
    pub fn total_misses(&self) -> u64 {
        self.readers.misses + self.pages.misses + self.headers.misses + self.packets.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_are_requests_minus_misses() {
        let counters = TierCounters::default();
        for _ in 0..5 {
            counters.record_request();
        }
        counters.record_miss();
        let stats = counters.snapshot(1);
        assert_eq!(stats.hits, 4);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.requests(), 5);

        counters.reset();
        assert_eq!(counters.snapshot(0), TierStats::default());
    }
}
