//! Bounded-Latency Store Wrapper
//!
//! Wraps any [`KeyValueStore`] so every operation is bounded by a timeout.
//! A slow or hung store turns into [`Error::StoreUnavailable`], which the
//! components above treat as "degrade, don't fail".

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::domain::ports::KeyValueStore;
use crate::error::{Error, Result};

/// [`KeyValueStore`] decorator applying `tokio::time::timeout` per operation.
pub struct TimeoutStore {
    inner: Arc<dyn KeyValueStore>,
    timeout: Duration,
    timeouts: AtomicU64,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            timeouts: AtomicU64::new(0),
        }
    }

    /// Configured per-operation bound
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of operations that hit the bound
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Store operation timed out");
                Err(Error::unavailable(
                    operation,
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for TimeoutStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        self.bounded("mget", self.inner.mget(keys)).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.bounded("set", self.inner.set(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.bounded("exists", self.inner.exists(key)).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.bounded("incr_by", self.inner.incr_by(key, delta)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.bounded("expire", self.inner.expire(key, ttl)).await
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<Bytes>> {
        self.bounded("get_and_delete", self.inner.get_and_delete(key))
            .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        self.bounded("zadd", self.inner.zadd(key, member, score)).await
    }

    async fn zupdate_score(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        self.bounded("zupdate_score", self.inner.zupdate_score(key, member, score))
            .await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.bounded("zscore", self.inner.zscore(key, member)).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.bounded("zrem", self.inner.zrem(key, member)).await
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.bounded("zcard", self.inner.zcard(key)).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        self.bounded("zrange_by_score", self.inner.zrange_by_score(key, min, max))
            .await
    }

    async fn zpop_by_score(
        &self,
        key: &str,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>> {
        self.bounded("zpop_by_score", self.inner.zpop_by_score(key, max, limit))
            .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.bounded("sadd", self.inner.sadd(key, member)).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.bounded("srem", self.inner.srem(key, member)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.bounded("smembers", self.inner.smembers(key)).await
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        self.bounded("scard", self.inner.scard(key)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.bounded("sismember", self.inner.sismember(key, member))
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("ping", self.inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKeyValueStore;

    #[tokio::test]
    async fn test_passes_through_when_fast() {
        let inner = Arc::new(InMemoryKeyValueStore::default());
        let store = TimeoutStore::new(inner, Duration::from_millis(200));

        store.set("k", Bytes::from("v"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(store.timeouts(), 0);
    }

    #[tokio::test]
    async fn test_slow_store_becomes_unavailable() {
        let inner = Arc::new(InMemoryKeyValueStore::default());
        inner.set_latency(Some(Duration::from_millis(200)));
        let store = TimeoutStore::new(inner, Duration::from_millis(20));

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(store.timeouts(), 1);
    }
}
