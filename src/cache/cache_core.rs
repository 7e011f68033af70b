//! Cache Core
//!
//! Generic get-or-compute cache with TTL and transparent compression. All
//! store failures are absorbed here: reads degrade to a miss or a bypass,
//! writes are best effort.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::compression::{CompressionAlgorithm, PayloadCompressor};
use super::entry::{CacheEnvelope, CachedValue};
use super::metrics::{CacheMetrics, CacheMetricsSnapshot};
use super::CacheConfig;
use crate::adapters::InMemoryKeyValueStore;
use crate::clock::{SharedClock, SystemClock};
use crate::domain::KeyValueStore;
use crate::error::{Error, Result};

/// Get-or-compute cache over a [`KeyValueStore`]
pub struct CacheCore {
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    compressor: PayloadCompressor,
    config: CacheConfig,
    key_prefix: String,
    metrics: Arc<CacheMetrics>,
}

impl CacheCore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
        key_prefix: impl Into<String>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            clock,
            compressor: PayloadCompressor::new(
                config.compression_threshold,
                config.compression_level,
            ),
            config,
            key_prefix: key_prefix.into(),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// Cache over a fresh in-memory store (for testing)
    pub fn in_memory() -> Self {
        let clock = SystemClock::shared();
        Self::new(
            Arc::new(InMemoryKeyValueStore::new(clock.clone())),
            clock,
            "mc",
            CacheConfig::default(),
        )
    }

    /// Namespaced store key for a cache key
    pub fn store_key(&self, key: &str) -> String {
        format!("{}:cache:{}", self.key_prefix, key)
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// Only errors from `compute` reach the caller. When the store is
    /// unreachable the value is computed directly and not stored.
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match self.try_get_entry::<T>(key).await {
            Ok(Some(hit)) => Ok(hit.value),
            Ok(None) => {
                let value = compute().await?;
                self.store_best_effort(key, &value, ttl).await;
                Ok(value)
            }
            Err(e) => {
                self.metrics.record_bypass();
                warn!(key, error = %e, "Cache bypass, computing without store");
                compute().await
            }
        }
    }

    /// Cached value, or `None` on a miss or store outage
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|hit| hit.value)
    }

    /// Cached value with its age, or `None` on a miss or store outage
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CachedValue<T>> {
        match self.try_get_entry(key).await {
            Ok(hit) => hit,
            Err(e) => {
                self.metrics.record_bypass();
                debug!(key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Like [`get_entry`](Self::get_entry) but surfaces store errors so
    /// callers can tell a miss from an outage.
    ///
    /// Malformed entries are invalidated and reported as a miss.
    pub async fn try_get_entry<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<CachedValue<T>>> {
        let store_key = self.store_key(key);

        let started = Instant::now();
        let raw = self.store.get(&store_key).await?;
        self.metrics.record_read_latency(started.elapsed());

        let Some(raw) = raw else {
            self.metrics.record_miss();
            return Ok(None);
        };

        match self.decode(key, &raw) {
            Ok(hit) => {
                self.metrics.record_hit();
                Ok(Some(hit))
            }
            Err(e) => {
                self.discard_malformed(&store_key, e).await;
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    /// Whether a live entry exists for `key`
    pub async fn contains(&self, key: &str) -> Result<bool> {
        self.store.exists(&self.store_key(key)).await
    }

    /// One multi-key read. Positions line up with `keys`; misses and
    /// malformed entries are `None`.
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<Option<T>>> {
        let store_keys: Vec<String> = keys.iter().map(|k| self.store_key(k)).collect();

        let started = Instant::now();
        let raws = self.store.mget(&store_keys).await?;
        self.metrics.record_read_latency(started.elapsed());

        let mut values = Vec::with_capacity(raws.len());
        for ((key, store_key), raw) in keys.iter().zip(&store_keys).zip(raws) {
            let value = match raw {
                None => None,
                Some(raw) => match self.decode::<T>(key, &raw) {
                    Ok(hit) => Some(hit.value),
                    Err(e) => {
                        self.discard_malformed(store_key, e).await;
                        None
                    }
                },
            };
            match value {
                Some(_) => self.metrics.record_hit(),
                None => self.metrics.record_miss(),
            }
            values.push(value);
        }
        Ok(values)
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Store `value` under `key`. `None` uses the configured default TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let blob = self.encode(key, value)?;
        self.store
            .set(
                &self.store_key(key),
                blob,
                Some(ttl.unwrap_or(self.config.default_ttl)),
            )
            .await
    }

    /// Drop the entry for `key`. Returns whether one existed.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        self.store.delete(&self.store_key(key)).await
    }

    /// Drop several entries, returning how many existed
    pub async fn invalidate_many(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.invalidate(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// [`set`](Self::set) that logs instead of failing
    pub(crate) async fn store_best_effort<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        match self.set(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Failed to store computed value");
                false
            }
        }
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    fn encode<T: Serialize>(&self, key: &str, value: &T) -> Result<Bytes> {
        let json = serde_json::to_vec(value).map_err(|e| Error::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let (payload, algorithm) = self.compressor.compress(&json);
        if algorithm != CompressionAlgorithm::None {
            self.metrics.record_compressed_write(json.len(), payload.len());
        }

        Ok(CacheEnvelope::new(self.clock.now_millis(), algorithm, payload).encode())
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, raw: &Bytes) -> Result<CachedValue<T>> {
        let envelope = CacheEnvelope::decode(key, raw)?;

        let payload = self
            .compressor
            .decompress(&envelope.payload, envelope.algorithm)
            .map_err(|e| Error::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let value = serde_json::from_slice(&payload).map_err(|e| Error::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        Ok(CachedValue::from_envelope(
            value,
            &envelope,
            self.clock.now_millis(),
        ))
    }

    async fn discard_malformed(&self, store_key: &str, error: Error) {
        self.metrics.record_serialization_error();
        warn!(key = store_key, error = %error, "Dropping malformed cache entry");
        if let Err(e) = self.store.delete(store_key).await {
            debug!(key = store_key, error = %e, "Failed to drop malformed entry");
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Shared metrics handle, also used by the accelerators
    pub fn metrics_handle(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Get metrics snapshot
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl std::fmt::Debug for CacheCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCore")
            .field("key_prefix", &self.key_prefix)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde::Deserialize;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Listing {
        id: u64,
        title: String,
    }

    fn listing(id: u64) -> Listing {
        Listing {
            id,
            title: format!("listing-{}", id),
        }
    }

    fn setup() -> (CacheCore, Arc<InMemoryKeyValueStore>, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryKeyValueStore::new(clock.clone()));
        let cache = CacheCore::new(store.clone(), clock.clone(), "test", CacheConfig::default());
        (cache, store, clock)
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let (cache, _, _) = setup();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_compute("listing:1", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(listing(1))
                })
                .await
                .unwrap();
            assert_eq!(value, listing(1));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 2);
    }

    #[tokio::test]
    async fn test_compute_error_propagates_and_is_not_cached() {
        let (cache, _, _) = setup();

        let result: std::result::Result<Listing, String> = cache
            .get_or_compute("listing:2", None, || async { Err("db down".to_string()) })
            .await;
        assert_eq!(result.unwrap_err(), "db down");
        assert!(!cache.contains("listing:2").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry_recomputes() {
        let (cache, _, clock) = setup();
        let calls = AtomicUsize::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(listing(3))
        };

        cache
            .get_or_compute("listing:3", Some(Duration::from_secs(10)), compute)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(11));
        cache
            .get_or_compute("listing:3", Some(Duration::from_secs(10)), compute)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_outage_bypasses_cache() {
        let (cache, store, _) = setup();
        store.set_available(false);

        let value = cache
            .get_or_compute("listing:4", None, || async {
                Ok::<_, Infallible>(listing(4))
            })
            .await
            .unwrap();

        assert_eq!(value, listing(4));
        assert_eq!(cache.metrics().bypasses, 1);
        assert_eq!(cache.get::<Listing>("listing:4").await, None);
    }

    #[tokio::test]
    async fn test_malformed_entry_is_invalidated_and_recomputed() {
        let (cache, store, _) = setup();
        store
            .set(
                &cache.store_key("listing:5"),
                Bytes::from_static(b"not an envelope"),
                None,
            )
            .await
            .unwrap();

        let value = cache
            .get_or_compute("listing:5", None, || async {
                Ok::<_, Infallible>(listing(5))
            })
            .await
            .unwrap();

        assert_eq!(value, listing(5));
        assert_eq!(cache.metrics().serialization_errors, 1);
        // recomputed value replaced the garbage
        assert_eq!(cache.get::<Listing>("listing:5").await, Some(listing(5)));
    }

    #[tokio::test]
    async fn test_type_mismatch_counts_as_malformed() {
        let (cache, _, _) = setup();
        cache.set("k", &"a string", None).await.unwrap();

        assert_eq!(cache.get::<Listing>("k").await, None);
        assert!(!cache.contains("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_large_values_are_compressed() {
        let (cache, store, _) = setup();
        let big = "x".repeat(10_000);

        cache.set("big", &big, None).await.unwrap();

        let raw = store.get(&cache.store_key("big")).await.unwrap().unwrap();
        assert!(raw.len() < big.len());

        let hit = cache.get_entry::<String>("big").await.unwrap();
        assert!(hit.compressed);
        assert_eq!(hit.value, big);
        assert!(cache.metrics().bytes_saved > 0);
    }

    #[tokio::test]
    async fn test_entry_age_follows_clock() {
        let (cache, _, clock) = setup();
        cache.set("aged", &1u32, None).await.unwrap();
        clock.advance(Duration::from_secs(7));

        let hit = cache.get_entry::<u32>("aged").await.unwrap();
        assert_eq!(hit.age, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_get_many_and_invalidate_many() {
        let (cache, _, _) = setup();
        cache.set("a", &listing(1), None).await.unwrap();
        cache.set("c", &listing(3), None).await.unwrap();

        let keys: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let values = cache.get_many::<Listing>(&keys).await.unwrap();
        assert_eq!(values, vec![Some(listing(1)), None, Some(listing(3))]);

        assert_eq!(cache.invalidate_many(&keys).await.unwrap(), 2);
        assert!(!cache.contains("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let (cache, store, _) = setup();
        cache.set("listing:9", &listing(9), None).await.unwrap();
        assert!(store.exists("test:cache:listing:9").await.unwrap());
    }
}
