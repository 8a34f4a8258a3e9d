use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::limits::EffectiveLimits;

/// Cache key for effective limits
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub strategy: String,
    pub symbol: String,
}

impl CacheKey {
    pub fn new(strategy: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            symbol: symbol.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    limits: EffectiveLimits,
    expires_at: Instant,
}

/// Bounded TTL cache of effective limits.
///
/// Inserting a new key into a full cache evicts the one entry with the
/// nearest expiry. Replacing an existing key never evicts.
#[derive(Debug)]
pub struct LimitCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    stats: RwLock<CacheStats>,
}

impl LimitCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            capacity: capacity.max(1),
            ttl,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Unexpired entry for `key`. Expired entries are dropped on access.
    pub fn get(&self, key: &CacheKey) -> Option<EffectiveLimits> {
        let hit = {
            let mut entries = self.entries.lock();
            let now = Instant::now();
            match entries.get(key).map(|e| (e.expires_at > now, e.limits.clone())) {
                Some((true, limits)) => Some(limits),
                Some((false, _)) => {
                    entries.remove(key);
                    None
                }
                None => None,
            }
        };

        let mut stats = self.stats.write();
        if hit.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        hit
    }

    pub fn insert(&self, key: CacheKey, limits: EffectiveLimits) {
        let evicted = {
            let mut entries = self.entries.lock();
            let evicted = if !entries.contains_key(&key) && entries.len() >= self.capacity {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(k, _)| k.clone());
                victim.and_then(|k| entries.remove(&k)).is_some()
            } else {
                false
            };
            entries.insert(
                key,
                CacheEntry {
                    limits,
                    expires_at: Instant::now() + self.ttl,
                },
            );
            evicted
        };

        let mut stats = self.stats.write();
        stats.stores += 1;
        if evicted {
            stats.evictions += 1;
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        tracing::info!("Limit cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.size = self.len();
        stats.capacity = self.capacity;
        stats.ttl_ms = self.ttl.as_millis() as u64;
        stats
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_types::RiskLimitSet;
    use rust_decimal_macros::dec;

    fn limits(symbol: &str) -> EffectiveLimits {
        EffectiveLimits::base(
            "arbitrage",
            symbol,
            RiskLimitSet::new(dec!(0.05), dec!(2), dec!(0.002), dec!(0.01)),
            "test".to_string(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn hit_until_expiry() {
        let cache = LimitCache::new(10, Duration::from_secs(5));
        let key = CacheKey::new("arbitrage", "BTCUSD");
        cache.insert(key.clone(), limits("BTCUSD"));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(cache.get(&key).is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.stores), (1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_nearest_expiry() {
        let cache = LimitCache::new(3, Duration::from_secs(60));
        for symbol in ["A", "B", "C"] {
            cache.insert(CacheKey::new("arbitrage", symbol), limits(symbol));
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        cache.insert(CacheKey::new("arbitrage", "D"), limits("D"));

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&CacheKey::new("arbitrage", "A")));
        for symbol in ["B", "C", "D"] {
            assert!(cache.contains(&CacheKey::new("arbitrage", symbol)));
        }
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_key_in_full_cache_keeps_others() {
        let cache = LimitCache::new(2, Duration::from_secs(60));
        cache.insert(CacheKey::new("arbitrage", "A"), limits("A"));
        cache.insert(CacheKey::new("arbitrage", "B"), limits("B"));
        cache.insert(CacheKey::new("arbitrage", "A"), limits("A"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn size_never_exceeds_capacity() {
        let cache = LimitCache::new(16, Duration::from_secs(60));
        for i in 0..200 {
            let symbol = format!("SYM{i}");
            cache.insert(CacheKey::new("htf", symbol.clone()), limits(&symbol));
            assert!(cache.len() <= 16);
        }
        assert_eq!(cache.stats().evictions, 184);
    }
}
