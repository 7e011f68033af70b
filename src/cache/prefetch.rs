//! Pagination Prefetch
//!
//! Serving page N of a listing schedules a background fill of page N+1 so
//! the next scroll is a cache hit. Prefetch work never delays or fails the
//! response that triggered it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::cache_core::CacheCore;
use super::metrics::CacheMetrics;

/// Background next-page population for paginated fetches
pub struct PrefetchCoordinator {
    cache: Arc<CacheCore>,
    page_size: usize,
    ttl: Duration,
    metrics: Arc<CacheMetrics>,
}

impl PrefetchCoordinator {
    pub fn new(cache: Arc<CacheCore>, page_size: usize, ttl: Duration) -> Self {
        let metrics = cache.metrics_handle();
        Self {
            cache,
            page_size: page_size.max(1),
            ttl,
            metrics,
        }
    }

    /// Use the cache's configured page size and prefetch TTL
    pub fn from_config(cache: Arc<CacheCore>) -> Self {
        let (page_size, ttl) = (cache.config().page_size, cache.config().prefetch_ttl);
        Self::new(cache, page_size, ttl)
    }

    /// Cache key of one page of a listing
    pub fn page_key(base_key: &str, page: u32) -> String {
        format!("{}:page:{}", base_key, page)
    }

    /// Serve `page`, then prefetch `page + 1` in the background.
    ///
    /// A page shorter than `page_size` is the last one, so nothing is
    /// prefetched after it.
    pub async fn get_page<T, F, Fut, E>(
        &self,
        base_key: &str,
        page: u32,
        fetch: F,
    ) -> std::result::Result<Vec<T>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(u32) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<T>, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let key = Self::page_key(base_key, page);
        let fetch_current = fetch.clone();
        let items = self
            .cache
            .get_or_compute(&key, Some(self.ttl), move || fetch_current(page))
            .await?;

        if items.len() >= self.page_size {
            if let Some(next) = page.checked_add(1) {
                self.spawn_prefetch::<T, F, Fut, E>(base_key, next, fetch);
            }
        }

        Ok(items)
    }

    /// Eagerly populate `pages`, skipping those already cached.
    ///
    /// Returns how many pages were written. Failures are logged and skipped.
    pub async fn warm<T, F, Fut, E>(
        &self,
        base_key: &str,
        pages: impl IntoIterator<Item = u32>,
        fetch: F,
    ) -> usize
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(u32) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<T>, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let fills = pages.into_iter().map(|page| {
            let fetch = fetch.clone();
            async move { populate(&self.cache, &self.metrics, base_key, page, self.ttl, fetch).await }
        });

        join_all(fills).await.into_iter().filter(|written| *written).count()
    }

    fn spawn_prefetch<T, F, Fut, E>(&self, base_key: &str, page: u32, fetch: F)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn(u32) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<T>, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.metrics.record_prefetch_scheduled();
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();
        let base_key = base_key.to_string();
        let ttl = self.ttl;

        tokio::spawn(async move {
            populate(&cache, &metrics, &base_key, page, ttl, fetch).await;
        });
    }
}

/// Fetch and store one page unless it is already cached. Returns whether the
/// page was written.
async fn populate<T, F, Fut, E>(
    cache: &CacheCore,
    metrics: &CacheMetrics,
    base_key: &str,
    page: u32,
    ttl: Duration,
    fetch: F,
) -> bool
where
    T: Serialize,
    F: Fn(u32) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<T>, E>>,
    E: std::fmt::Display,
{
    let key = PrefetchCoordinator::page_key(base_key, page);

    match cache.contains(&key).await {
        Ok(true) => {
            metrics.record_prefetch_skipped();
            debug!(key = %key, "Page already cached, skipping prefetch");
            return false;
        }
        Ok(false) => {}
        Err(e) => {
            metrics.record_prefetch_failed();
            debug!(key = %key, error = %e, "Store unavailable, skipping prefetch");
            return false;
        }
    }

    match fetch(page).await {
        Ok(items) => {
            let written = cache.store_best_effort(&key, &items, Some(ttl)).await;
            if !written {
                metrics.record_prefetch_failed();
            }
            written
        }
        Err(e) => {
            metrics.record_prefetch_failed();
            warn!(key = %key, error = %e, "Prefetch fetch failed");
            false
        }
    }
}

impl std::fmt::Debug for PrefetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchCoordinator")
            .field("page_size", &self.page_size)
            .field("ttl", &self.ttl)
            .finish()
    }
}
