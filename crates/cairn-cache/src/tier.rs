use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use moka::future::Cache;
use tracing::trace;

use crate::stats::{TierCounters, TierStats};

/// One cache tier: an optional moka cache plus its counters.
///
/// With no cache (capacity zero) every request runs its loader directly and
/// counts as a miss.
pub(crate) struct Tier<K, V> {
    name: &'static str,
    cache: Option<Cache<K, V>>,
    counters: TierCounters,
}

impl<K, V> Tier<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A tier bounded by entry count.
    pub(crate) fn counted(name: &'static str, capacity: u64) -> Self {
        let cache = (capacity > 0).then(|| Cache::builder().name(name).max_capacity(capacity).build());
        Self {
            name,
            cache,
            counters: TierCounters::default(),
        }
    }

    /// A tier bounded by the summed weight of its entries.
    pub(crate) fn weighted<W>(name: &'static str, capacity: u64, weigher: W) -> Self
    where
        W: Fn(&K, &V) -> u32 + Send + Sync + 'static,
    {
        let cache = (capacity > 0).then(|| {
            Cache::builder()
                .name(name)
                .weigher(weigher)
                .max_capacity(capacity)
                .build()
        });
        Self {
            name,
            cache,
            counters: TierCounters::default(),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Return the cached value or run `load` once for all concurrent
    /// callers of the same key. Errors reach every waiter and are not cached.
    pub(crate) async fn try_get_with<E, Fut>(&self, key: K, load: Fut) -> Result<V, Arc<E>>
    where
        Fut: Future<Output = Result<V, E>>,
        E: Send + Sync + 'static,
    {
        self.counters.record_request();
        // Loaders nest tiers inside each other; boxing keeps each level's
        // state off the caller's stack.
        let Some(cache) = &self.cache else {
            self.counters.record_miss();
            return Box::pin(load).await.map_err(Arc::new);
        };

        let counters = &self.counters;
        let name = self.name;
        let logged_key = key.clone();
        let loader = Box::pin(async move {
            counters.record_miss();
            trace!(tier = name, key = ?logged_key, "cache miss");
            load.await
        });
        Box::pin(cache.try_get_with(key, loader)).await
    }

    pub(crate) async fn get(&self, key: &K) -> Option<V> {
        match &self.cache {
            Some(cache) => cache.get(key).await,
            None => None,
        }
    }

    pub(crate) fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    pub(crate) async fn run_pending_tasks(&self) {
        if let Some(cache) = &self.cache {
            cache.run_pending_tasks().await;
        }
    }

    pub(crate) fn stats(&self) -> TierStats {
        let entries = self.cache.as_ref().map_or(0, |c| c.entry_count());
        self.counters.snapshot(entries)
    }

    pub(crate) fn reset_stats(&self) {
        self.counters.reset();
    }
}
