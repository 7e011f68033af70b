//! Stale-While-Revalidate
//!
//! Entries live in the store for `hard_ttl`. Once an entry is older than
//! `soft_ttl` the next read still returns it immediately, and a single
//! background refresh per key recomputes and overwrites it.
//!
//! ```text
//!  age:  0 ──────── soft_ttl ──────────────── hard_ttl
//!        │  fresh    │  stale: serve + refresh │  evicted: compute inline
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::cache_core::CacheCore;
use super::metrics::CacheMetrics;
use crate::error::{Error, Result};

/// Stale-while-revalidate reads over a [`CacheCore`]
pub struct StaleWhileRevalidate {
    cache: Arc<CacheCore>,
    soft_ttl: Duration,
    hard_ttl: Duration,
    in_flight: Arc<DashSet<String>>,
    metrics: Arc<CacheMetrics>,
}

/// Releases the per-key refresh slot when the refresh task ends, however it
/// ends.
struct InFlightGuard {
    in_flight: Arc<DashSet<String>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

impl StaleWhileRevalidate {
    /// `soft_ttl` must be strictly below `hard_ttl`.
    pub fn new(cache: Arc<CacheCore>, soft_ttl: Duration, hard_ttl: Duration) -> Result<Self> {
        if soft_ttl >= hard_ttl {
            return Err(Error::Config(format!(
                "soft_ttl ({:?}) must be below hard_ttl ({:?})",
                soft_ttl, hard_ttl
            )));
        }
        let metrics = cache.metrics_handle();
        Ok(Self {
            cache,
            soft_ttl,
            hard_ttl,
            in_flight: Arc::new(DashSet::new()),
            metrics,
        })
    }

    /// Use the cache's configured TTL window
    pub fn from_config(cache: Arc<CacheCore>) -> Result<Self> {
        let (soft, hard) = (cache.config().soft_ttl, cache.config().hard_ttl);
        Self::new(cache, soft, hard)
    }

    /// Read `key`, serving stale values while a refresh runs.
    ///
    /// A cold key computes inline. A stale key returns immediately and
    /// spawns at most one refresh; `compute` is dropped unused when a
    /// refresh is already in flight or the entry is fresh.
    pub async fn get<T, F, Fut, E>(&self, key: &str, compute: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        match self.cache.try_get_entry::<T>(key).await {
            Ok(Some(hit)) => {
                if hit.is_stale(self.soft_ttl) {
                    self.metrics.record_stale_serve();
                    self.spawn_refresh(key, compute);
                }
                Ok(hit.value)
            }
            Ok(None) => {
                let value = compute().await?;
                self.cache
                    .store_best_effort(key, &value, Some(self.hard_ttl))
                    .await;
                Ok(value)
            }
            Err(e) => {
                self.metrics.record_bypass();
                warn!(key, error = %e, "SWR read bypassing store");
                compute().await
            }
        }
    }

    /// Whether a refresh for `key` is running
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    pub fn refreshes_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn soft_ttl(&self) -> Duration {
        self.soft_ttl
    }

    pub fn hard_ttl(&self) -> Duration {
        self.hard_ttl
    }

    fn spawn_refresh<T, F, Fut, E>(&self, key: &str, compute: F)
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        if !self.in_flight.insert(key.to_string()) {
            debug!(key, "Refresh already in flight");
            return;
        }
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            key: key.to_string(),
        };

        self.metrics.record_refresh_started();
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let hard_ttl = self.hard_ttl;

        tokio::spawn(async move {
            match compute().await {
                Ok(value) => {
                    if !cache.store_best_effort(&guard.key, &value, Some(hard_ttl)).await {
                        metrics.record_refresh_failed();
                    }
                }
                Err(e) => {
                    metrics.record_refresh_failed();
                    warn!(key = %guard.key, error = %e, "Background refresh failed, keeping stale value");
                }
            }
            drop(guard);
        });
    }
}

impl std::fmt::Debug for StaleWhileRevalidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleWhileRevalidate")
            .field("soft_ttl", &self.soft_ttl)
            .field("hard_ttl", &self.hard_ttl)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
