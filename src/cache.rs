// In-process TTL cache with cache-aside loading
// Shared by every provider adapter; entries are never served past their expiry.

use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub load_count: usize,
    pub load_failure_count: usize,
    pub coalesced_count: usize,
    pub expired_count: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(600),
        }
    }
}

pub fn create_cache_key(scope: &str, name: &str) -> String {
    format!("{}:{}", scope, name)
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_alive(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct TtlCache<V> {
    store: DashMap<String, CacheEntry<V>>,
    // one async lock per key currently being loaded
    loading: DashMap<String, Arc<Mutex<()>>>,
    config: CacheConfig,
    cache_stats: RwLock<CacheStats>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            store: DashMap::new(),
            loading: DashMap::new(),
            config,
            cache_stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();

        let (value, expired) = match self.store.get(key) {
            Some(entry) if entry.is_alive(now) => (Some(entry.value.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };

        // the shard guard from `get` is released before removing
        if expired
            && self
                .store
                .remove_if(key, |_, entry| !entry.is_alive(now))
                .is_some()
        {
            self.cache_stats.write().expired_count += 1;
        }

        value
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if !self.config.enabled {
            return None;
        }

        let value = self.lookup(key);

        let mut stats = self.cache_stats.write();
        if value.is_some() {
            stats.hit_count += 1;
        } else {
            stats.miss_count += 1;
        }

        value
    }

    // None uses the configured default TTL
    pub fn insert(&self, key: &str, value: V, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.store.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Returns the live value for `key`, or runs `loader`, caches its success
    /// for `ttl` and returns it. Loader errors are returned unchanged and
    /// nothing is cached. Concurrent misses on the same key run the loader
    /// once; other keys are never blocked.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, ttl: Duration, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if !self.config.enabled {
            return loader().await;
        }

        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let key_lock = self
            .loading
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = key_lock.lock().await;

            if let Some(value) = self.lookup(key) {
                self.cache_stats.write().coalesced_count += 1;
                Ok(value)
            } else {
                self.cache_stats.write().load_count += 1;

                match loader().await {
                    Ok(value) => {
                        self.insert(key, value.clone(), Some(ttl));
                        Ok(value)
                    }
                    Err(e) => {
                        self.cache_stats.write().load_failure_count += 1;
                        Err(e)
                    }
                }
            }
        };

        drop(key_lock);
        self.loading
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.store.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.store.len();
        self.store.retain(|_, entry| entry.is_alive(now));
        let removed = before.saturating_sub(self.store.len());

        if removed > 0 {
            self.cache_stats.write().expired_count += removed;
            tracing::debug!(removed, "purged expired cache entries");
        }

        removed
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.cache_stats.read().clone();
        stats.items_count = self.store.len();
        stats
    }

    /// Periodically sweeps expired entries. The task ends on its own once
    /// the cache is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.purge_expired();
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_cache() -> Arc<TtlCache<Vec<u8>>> {
        Arc::new(TtlCache::new(CacheConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiration_and_ttl() {
        let cache = test_cache();

        cache.insert("routes:provider1", vec![1, 2, 3], Some(Duration::from_secs(5)));
        cache.insert("routes:provider2", vec![4, 5, 6], Some(Duration::from_secs(2)));

        assert!(cache.get("routes:provider1").is_some());
        assert!(cache.get("routes:provider2").is_some());

        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(cache.get("routes:provider1").is_some());
        assert!(cache.get("routes:provider2").is_none());

        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(cache.get("routes:provider1").is_none());

        let stats = cache.stats();
        assert!(stats.expired_count >= 2, "Expected at least 2 expired items");
        assert_eq!(stats.items_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_load_within_ttl_loads_once() {
        let cache = test_cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Result<Vec<u8>, String> = cache
                .get_or_load("k", Duration::from_secs(10), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![7])
                })
                .await;
            assert_eq!(value.unwrap(), vec![7]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;

        let _: Result<Vec<u8>, String> = cache
            .get_or_load("k", Duration::from_secs(10), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![8])
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get("k"), Some(vec![8]));
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let cache = test_cache();

        let failed: Result<Vec<u8>, String> = cache
            .get_or_load("k", Duration::from_secs(10), || async { Err("boom".to_string()) })
            .await;
        assert_eq!(failed.unwrap_err(), "boom");
        assert!(cache.is_empty());

        let loaded: Result<Vec<u8>, String> = cache
            .get_or_load("k", Duration::from_secs(10), || async { Ok(vec![1]) })
            .await;
        assert_eq!(loaded.unwrap(), vec![1]);

        let stats = cache.stats();
        assert_eq!(stats.load_failure_count, 1);
        assert_eq!(stats.load_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_are_coalesced() {
        let cache = test_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("popular", Duration::from_secs(60), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(vec![42])
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), vec![42]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.loading.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access_independent_keys() {
        let cache = test_cache();
        let mut handles = vec![];

        for i in 0..16u8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..100u8 {
                    let key = create_cache_key("routes", &format!("provider{}-{}", i, j % 10));
                    if rand::random::<f64>() < 0.8 {
                        let _ = cache
                            .get_or_load(&key, Duration::from_secs(60), || async move {
                                Ok::<_, String>(vec![i, j])
                            })
                            .await;
                    } else {
                        cache.invalidate(&key);
                    }
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(cache.len() <= 160);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep() {
        let cache = test_cache();
        cache.insert("a", vec![1], Some(Duration::from_secs(1)));
        cache.insert("b", vec![2], Some(Duration::from_secs(100)));

        let sweeper = cache.spawn_cleanup(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get("b").is_some());

        drop(cache);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test]
    async fn test_disabled_cache_always_loads() {
        let cache: TtlCache<u32> = TtlCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let _ = cache
                .get_or_load("k", Duration::from_secs(60), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(1)
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
