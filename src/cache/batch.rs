//! Batched Lookups
//!
//! `get_many` resolves a list of ids with one multi-key cache read and at
//! most one call to the underlying source, which only sees the ids the cache
//! could not answer.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::cache_core::CacheCore;
use super::metrics::CacheMetrics;

/// Multi-id cache lookups with a single source fallback
pub struct BatchFetcher {
    cache: Arc<CacheCore>,
    namespace: String,
    ttl: Option<Duration>,
    metrics: Arc<CacheMetrics>,
}

impl BatchFetcher {
    /// `namespace` scopes ids, e.g. `"product"` caches id `42` as `product:42`.
    pub fn new(cache: Arc<CacheCore>, namespace: impl Into<String>) -> Self {
        let metrics = cache.metrics_handle();
        Self {
            cache,
            namespace: namespace.into(),
            ttl: None,
            metrics,
        }
    }

    /// Backfill TTL; defaults to the cache's `default_ttl`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn cache_key(&self, id: &str) -> String {
        format!("{}:{}", self.namespace, id)
    }

    /// Resolve `ids`, preserving input order.
    ///
    /// Ids found in neither the cache nor the source are omitted. Duplicate
    /// ids are asked of the source once but appear in the output as often as
    /// in the input. When the cache read fails the source is asked for every
    /// id and backfill is best effort.
    pub async fn get_many<T, F, Fut, E>(
        &self,
        ids: &[String],
        source: F,
    ) -> std::result::Result<Vec<(String, T)>, E>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = std::result::Result<HashMap<String, T>, E>>,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.cache_key(id)).collect();
        let cached: Vec<Option<T>> = match self.cache.get_many(&keys).await {
            Ok(values) => values,
            Err(e) => {
                self.metrics.record_bypass();
                warn!(namespace = %self.namespace, error = %e, "Batch cache read failed, using source for all ids");
                vec![None; ids.len()]
            }
        };

        let mut found: HashMap<String, T> = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for (id, value) in ids.iter().zip(cached) {
            match value {
                Some(value) => {
                    found.insert(id.clone(), value);
                }
                None => {
                    if seen.insert(id.as_str()) {
                        missing.push(id.clone());
                    }
                }
            }
        }
        // A duplicate id can hit at one position and miss at another if the
        // entry lapsed between reads; the cached copy wins.
        missing.retain(|id| !found.contains_key(id));

        if !missing.is_empty() {
            self.metrics.record_batch_source_call();
            debug!(namespace = %self.namespace, missing = missing.len(), "Batch source call");
            let fetched = source(missing).await?;

            for (id, value) in fetched {
                self.cache
                    .store_best_effort(&self.cache_key(&id), &value, self.ttl)
                    .await;
                found.insert(id, value);
            }
        }

        Ok(ids
            .iter()
            .filter_map(|id| found.get(id).map(|value| (id.clone(), value.clone())))
            .collect())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl std::fmt::Debug for BatchFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchFetcher")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .finish()
    }
}
