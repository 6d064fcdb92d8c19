//! Read cache for Cairn bundles.
//!
//! Four independent tiers sit between bundle readers and the backend:
//!
//! | Tier | Key | Bound |
//! |------|-----|-------|
//! | readers | locator | entry count |
//! | pages | locator + page index | entry count |
//! | headers | locator | header bytes |
//! | packets | locator + packet + encoded/decoded | packet bytes |
//!
//! Every tier is single-flight: concurrent misses on one key run a single
//! loader and all callers receive its result, success or error. Failed
//! loads are never cached. Values are reference counted, so eviction never
//! invalidates a buffer a caller already holds.

pub mod config;
pub mod stats;
mod tier;

use std::future::Future;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use cairn_bundle::BundleHeader;
use cairn_types::BlobLocator;

pub use config::CacheConfig;
pub use stats::{CacheStats, TierStats};

use tier::Tier;

/// Key of one fixed-size window of a blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub locator: BlobLocator,
    pub page: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketForm {
    Encoded,
    Decoded,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PacketKey {
    pub locator: BlobLocator,
    pub packet: u32,
    pub form: PacketForm,
}

impl PacketKey {
    pub fn new(locator: BlobLocator, packet: u32, form: PacketForm) -> Self {
        Self {
            locator,
            packet,
            form,
        }
    }
}

/// A parsed header together with its encoded length, which is its weight.
#[derive(Clone, Debug)]
pub struct CachedHeader {
    pub header: Arc<BundleHeader>,
    pub length: usize,
}

impl CachedHeader {
    pub fn new(header: BundleHeader, length: usize) -> Self {
        Self {
            header: Arc::new(header),
            length,
        }
    }
}

fn weight(len: usize) -> u32 {
    len.clamp(1, u32::MAX as usize) as u32
}

/// Multi-tier cache shared by every reader of one storage client.
///
/// `R` is the packet reader type cached in the reader tier.
pub struct BundleCache<R> {
    config: CacheConfig,
    readers: Tier<BlobLocator, Arc<R>>,
    pages: Tier<PageKey, Bytes>,
    headers: Tier<BlobLocator, CachedHeader>,
    packets: Tier<PacketKey, Bytes>,
}

impl<R> BundleCache<R>
where
    R: Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            readers: Tier::counted("readers", config.reader_count),
            pages: Tier::counted("pages", config.page_count),
            headers: Tier::weighted("headers", config.header_bytes, |_, v: &CachedHeader| {
                weight(v.length)
            }),
            packets: Tier::weighted("packets", config.packet_bytes, |_, v: &Bytes| {
                weight(v.len())
            }),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size.max(1)
    }

    /// Pages overlapping `offset..offset + length`.
    pub fn pages_for(&self, offset: u64, length: u64) -> Range<u64> {
        let size = self.page_size() as u64;
        if length == 0 {
            return offset / size..offset / size;
        }
        offset / size..(offset + length).div_ceil(size)
    }

    pub async fn get_or_create_reader<E, Fut>(
        &self,
        locator: &BlobLocator,
        create: Fut,
    ) -> Result<Arc<R>, Arc<E>>
    where
        Fut: Future<Output = Result<Arc<R>, E>>,
        E: Send + Sync + 'static,
    {
        self.readers.try_get_with(locator.clone(), create).await
    }

    pub async fn get_or_read_page<E, Fut>(
        &self,
        locator: &BlobLocator,
        page: u64,
        read: Fut,
    ) -> Result<Bytes, Arc<E>>
    where
        Fut: Future<Output = Result<Bytes, E>>,
        E: Send + Sync + 'static,
    {
        let key = PageKey {
            locator: locator.clone(),
            page,
        };
        self.pages.try_get_with(key, read).await
    }

    pub async fn get_or_read_header<E, Fut>(
        &self,
        locator: &BlobLocator,
        read: Fut,
    ) -> Result<CachedHeader, Arc<E>>
    where
        Fut: Future<Output = Result<CachedHeader, E>>,
        E: Send + Sync + 'static,
    {
        self.headers.try_get_with(locator.clone(), read).await
    }

    pub async fn get_or_read_packet<E, Fut>(&self, key: PacketKey, read: Fut) -> Result<Bytes, Arc<E>>
    where
        Fut: Future<Output = Result<Bytes, E>>,
        E: Send + Sync + 'static,
    {
        self.packets.try_get_with(key, read).await
    }

    /// Header already resident, without loading or counting a request.
    pub async fn cached_header(&self, locator: &BlobLocator) -> Option<CachedHeader> {
        self.headers.get(locator).await
    }

    pub fn packets_enabled(&self) -> bool {
        self.packets.is_enabled()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            readers: self.readers.stats(),
            pages: self.pages.stats(),
            headers: self.headers.stats(),
            packets: self.packets.stats(),
        }
    }

    pub fn reset_stats(&self) {
        self.readers.reset_stats();
        self.pages.reset_stats();
        self.headers.reset_stats();
        self.packets.reset_stats();
    }

    /// Drop every entry. Buffers already handed out stay valid.
    pub fn clear(&self) {
        self.readers.clear();
        self.pages.clear();
        self.headers.clear();
        self.packets.clear();
    }

    /// Apply pending evictions and invalidations so entry counts are exact.
    pub async fn run_pending_tasks(&self) {
        self.readers.run_pending_tasks().await;
        self.pages.run_pending_tasks().await;
        self.headers.run_pending_tasks().await;
        self.packets.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type TestCache = BundleCache<String>;

    fn loc(s: &str) -> BlobLocator {
        BlobLocator::new(s)
    }

    #[tokio::test]
    async fn concurrent_misses_load_once() {
        let cache = TestCache::new(CacheConfig::default());
        let loads = AtomicUsize::new(0);
        let locator = loc("bundles/a");
        let (cache_ref, loads_ref, locator_ref) = (&cache, &loads, &locator);

        let requests = (0..8).map(move |_| {
            cache_ref.get_or_read_page(locator_ref, 0, async move {
                let loads = loads_ref;
                loads.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>(Bytes::from_static(b"page"))
            })
        });
        let results = futures::future::join_all(requests).await;

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), Bytes::from_static(b"page"));
        }
        let stats = cache.stats().pages;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 7);
    }

    #[tokio::test]
    async fn errors_reach_every_waiter_and_are_not_cached() {
        let cache = TestCache::new(CacheConfig::default());
        let locator = loc("bundles/bad");
        let (cache_ref, locator_ref) = (&cache, &locator);

        let requests = (0..4).map(move |_| {
            cache_ref.get_or_read_header(locator_ref, async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<CachedHeader, _>("corrupt".to_string())
            })
        });
        for result in futures::future::join_all(requests).await {
            assert_eq!(result.unwrap_err().as_str(), "corrupt");
        }
        assert_eq!(cache.stats().headers.misses, 1);

        let header = BundleHeader {
            version: cairn_bundle::BundleVersion::LATEST,
            compression: cairn_bundle::BundleCompressionFormat::None,
            imports: vec![],
            exports: vec![],
            packets: vec![],
        };
        let loaded = cache
            .get_or_read_header(&locator, async { Ok::<_, String>(CachedHeader::new(header, 11)) })
            .await
            .unwrap();
        assert_eq!(loaded.length, 11);
        assert!(cache.cached_header(&locator).await.is_some());
    }

    #[tokio::test]
    async fn disabled_tiers_still_load() {
        let cache = TestCache::new(CacheConfig::disabled());
        let loads = AtomicUsize::new(0);
        let key = PacketKey::new(loc("bundles/a"), 0, PacketForm::Decoded);
        for _ in 0..3 {
            let bytes = cache
                .get_or_read_packet(key.clone(), async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(Bytes::from_static(b"packet"))
                })
                .await
                .unwrap();
            assert_eq!(bytes, Bytes::from_static(b"packet"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 3);
        assert!(!cache.packets_enabled());
        let stats = cache.stats().packets;
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn encoded_and_decoded_packets_are_distinct() {
        let cache = TestCache::new(CacheConfig::default());
        let locator = loc("bundles/a");
        let encoded = cache
            .get_or_read_packet(PacketKey::new(locator.clone(), 0, PacketForm::Encoded), async {
                Ok::<_, String>(Bytes::from_static(b"enc"))
            })
            .await
            .unwrap();
        let decoded = cache
            .get_or_read_packet(PacketKey::new(locator.clone(), 0, PacketForm::Decoded), async {
                Ok::<_, String>(Bytes::from_static(b"decoded"))
            })
            .await
            .unwrap();
        assert_ne!(encoded, decoded);
        assert_eq!(cache.stats().packets.misses, 2);
    }

    #[tokio::test]
    async fn readers_are_shared() {
        let cache = TestCache::new(CacheConfig::default());
        let locator = loc("bundles/r");
        let first = cache
            .get_or_create_reader(&locator, async { Ok::<_, String>(Arc::new("reader".to_string())) })
            .await
            .unwrap();
        let second = cache
            .get_or_create_reader(&locator, async {
                Ok::<_, String>(Arc::new("other".to_string()))
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().readers.hits, 1);
    }

    #[tokio::test]
    async fn clear_keeps_handed_out_buffers() {
        let cache = TestCache::new(CacheConfig::default());
        let locator = loc("bundles/a");
        let page = cache
            .get_or_read_page(&locator, 3, async { Ok::<_, String>(Bytes::from(vec![9u8; 64])) })
            .await
            .unwrap();
        cache.run_pending_tasks().await;
        assert_eq!(cache.stats().pages.entries, 1);

        cache.clear();
        cache.run_pending_tasks().await;
        assert_eq!(cache.stats().pages.entries, 0);
        assert_eq!(page.len(), 64);

        let loads = AtomicUsize::new(0);
        cache
            .get_or_read_page(&locator, 3, async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(Bytes::from(vec![9u8; 64]))
            })
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn page_ranges() {
        let cache = TestCache::new(CacheConfig {
            page_size: 100,
            ..CacheConfig::default()
        });
        assert_eq!(cache.pages_for(0, 100), 0..1);
        assert_eq!(cache.pages_for(99, 2), 0..2);
        assert_eq!(cache.pages_for(250, 0), 2..2);
        assert_eq!(cache.pages_for(200, 301), 2..6);
    }
}
