//! Coordination Facade
//!
//! Wires every component against one store, one durable sink, one
//! publisher and one clock, and registers the standard maintenance jobs:
//!
//! | Job id                   | Interval                         | Work                          |
//! |--------------------------|----------------------------------|-------------------------------|
//! | `counters.views.flush`   | `counters.flush_interval`        | push buffered view deltas     |
//! | `expiration.offers.reap` | `expiration.reap_interval`       | expire due offers             |
//! | `ephemeral.viewers.reap` | `ephemeral.viewer_reap_interval` | drop viewers past the timeout |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::cache::{
    BatchFetcher, CacheCore, CacheMetricsSnapshot, PrefetchCoordinator, StaleWhileRevalidate,
};
use crate::clock::SharedClock;
use crate::config::CoordinationConfig;
use crate::counters::{CounterBuffer, CounterStats, VIEW_COUNTER};
use crate::domain::{
    DurableStore, EventPublisher, ItemStatus, KeyValueStore, RealtimeHooks, StatusTransition,
};
use crate::ephemeral::EphemeralStateTracker;
use crate::error::Result;
use crate::expiration::{ExpirationReaper, ExpirationTracker, ReaperStats, OFFER_NAMESPACE};
use crate::scheduler::{FnTask, JobStatus, Scheduler};

pub const VIEW_FLUSH_JOB: &str = "counters.views.flush";
pub const OFFER_REAP_JOB: &str = "expiration.offers.reap";
pub const VIEWER_REAP_JOB: &str = "ephemeral.viewers.reap";

/// Entry point for application collaborators
pub struct Coordinator {
    config: CoordinationConfig,
    store: Arc<dyn KeyValueStore>,
    durable: Arc<dyn DurableStore>,
    hooks: RealtimeHooks,
    cache: Arc<CacheCore>,
    swr: StaleWhileRevalidate,
    prefetch: PrefetchCoordinator,
    views: Arc<CounterBuffer>,
    offers: Arc<ExpirationReaper>,
    ephemeral: Arc<EphemeralStateTracker>,
    scheduler: Scheduler,
}

impl Coordinator {
    /// Build every component and register the maintenance jobs. The
    /// scheduler is not started; call [`start`](Self::start).
    pub fn new(
        config: CoordinationConfig,
        store: Arc<dyn KeyValueStore>,
        durable: Arc<dyn DurableStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        let prefix = config.store.key_prefix.as_str();
        let hooks = RealtimeHooks::new(publisher).with_clock(clock.clone());

        let cache = Arc::new(CacheCore::new(
            store.clone(),
            clock.clone(),
            prefix,
            config.cache.clone(),
        ));
        let swr = StaleWhileRevalidate::from_config(cache.clone())?;
        let prefetch = PrefetchCoordinator::from_config(cache.clone());

        let views = Arc::new(
            CounterBuffer::new(
                VIEW_COUNTER,
                prefix,
                store.clone(),
                durable.clone(),
                clock.clone(),
            )
            .with_hooks(hooks.clone()),
        );

        let tracker = Arc::new(
            ExpirationTracker::new(OFFER_NAMESPACE, prefix, store.clone(), clock.clone())
                .with_batch_limit(config.expiration.reap_batch_limit),
        );
        let offers = Arc::new(
            ExpirationReaper::new(tracker, durable.clone()).with_hooks(hooks.clone()),
        );

        let ephemeral = Arc::new(EphemeralStateTracker::new(
            store.clone(),
            clock.clone(),
            hooks.clone(),
            prefix,
            config.ephemeral.clone(),
        ));

        let scheduler = Scheduler::new(clock.clone());
        register_jobs(&scheduler, &config, &views, &offers, &ephemeral, &clock)?;

        Ok(Self {
            config,
            store,
            durable,
            hooks,
            cache,
            swr,
            prefetch,
            views,
            offers,
            ephemeral,
            scheduler,
        })
    }

    // =========================================================================
    // Read API
    // =========================================================================

    /// Cached value of `key`, computed on a miss. Store outages bypass the
    /// cache; only `compute` errors reach the caller.
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
        self.cache.get_or_compute(key, ttl, compute).await
    }

    /// Batch read of `ids` in `namespace` with one source call for misses
    pub async fn get_many<T, F, Fut, E>(
        &self,
        namespace: &str,
        ids: &[String],
        source: F,
    ) -> std::result::Result<Vec<(String, T)>, E>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = std::result::Result<HashMap<String, T>, E>>,
    {
        self.batch(namespace).get_many(ids, source).await
    }

    pub fn batch(&self, namespace: &str) -> BatchFetcher {
        BatchFetcher::new(self.cache.clone(), namespace).with_ttl(self.config.cache.default_ttl)
    }

    pub fn cache(&self) -> &Arc<CacheCore> {
        &self.cache
    }

    pub fn swr(&self) -> &StaleWhileRevalidate {
        &self.swr
    }

    pub fn prefetch(&self) -> &PrefetchCoordinator {
        &self.prefetch
    }

    // =========================================================================
    // Mutation API
    // =========================================================================

    /// Buffer one view of `entity_id`. Returns the unflushed total, or
    /// `None` when the store dropped the increment.
    pub async fn increment_view(&self, entity_id: &str) -> Option<i64> {
        self.views.increment(entity_id, 1).await
    }

    /// Durable `baseline` plus views not yet flushed
    pub async fn view_count(&self, entity_id: &str, baseline: i64) -> i64 {
        self.views.current_count(entity_id, baseline).await
    }

    /// Schedule `item_id` to expire at `expires_at`. Errors surface so the
    /// caller knows the deadline was not registered.
    pub async fn track_expiration(&self, item_id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.offers.tracker().track(item_id, expires_at).await
    }

    /// Move the deadline of a tracked item. Returns `false` when the item is
    /// no longer tracked (already reaped or completed).
    pub async fn extend_expiration(
        &self,
        item_id: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.offers.tracker().extend(item_id, new_expires_at).await
    }

    /// End an item's lifecycle for a reason other than expiry (accepted,
    /// cancelled).
    ///
    /// The item is untracked first so later reap cycles skip it. A reap
    /// that already popped the item is settled by the durable store's
    /// conditional transition: if `Expired` landed first this returns
    /// `Rejected`, otherwise the reaper's write is rejected. A failed write
    /// restores the deadline.
    #[instrument(skip(self))]
    pub async fn complete_item(&self, item_id: &str, status: ItemStatus) -> Result<StatusTransition> {
        let tracker = self.offers.tracker();
        let deadline = tracker.expires_at(item_id).await?;
        tracker.untrack(item_id).await?;

        match self.durable.update_status(item_id, status).await {
            Ok(transition) => Ok(transition),
            Err(e) => {
                if let Some(deadline) = deadline {
                    if let Err(retrack) = tracker.track(item_id, deadline).await {
                        error!(item_id, error = %retrack, "Failed to restore deadline after durable failure");
                    }
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Real-time
    // =========================================================================

    /// Viewers, typing, presence and unread counters
    pub fn ephemeral(&self) -> &EphemeralStateTracker {
        &self.ephemeral
    }

    pub fn hooks(&self) -> &RealtimeHooks {
        &self.hooks
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop the scheduler, then push whatever views are still buffered
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        match self.views.flush().await {
            Ok(report) if report.entities > 0 => {
                info!("Final flush pushed {} view deltas", report.entities)
            }
            Ok(_) => {}
            Err(e) => warn!("Final flush skipped: {}", e),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.scheduler.status()
    }

    /// Store round trip for readiness checks
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.cache.metrics()
    }

    pub fn view_stats(&self) -> CounterStats {
        self.views.stats()
    }

    pub fn reaper_stats(&self) -> ReaperStats {
        self.offers.stats()
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }
}

fn register_jobs(
    scheduler: &Scheduler,
    config: &CoordinationConfig,
    views: &Arc<CounterBuffer>,
    offers: &Arc<ExpirationReaper>,
    ephemeral: &Arc<EphemeralStateTracker>,
    clock: &SharedClock,
) -> Result<()> {
    let buffer = views.clone();
    scheduler.register(
        VIEW_FLUSH_JOB,
        config.counters.flush_interval,
        FnTask::new(move || {
            let buffer = buffer.clone();
            async move { buffer.flush().await.map(|_| ()) }
        }),
    )?;

    let reaper = offers.clone();
    scheduler.register(
        OFFER_REAP_JOB,
        config.expiration.reap_interval,
        FnTask::new(move || {
            let reaper = reaper.clone();
            async move { reaper.run_due().await.map(|_| ()) }
        }),
    )?;

    let tracker = ephemeral.clone();
    let clock = clock.clone();
    scheduler.register(
        VIEWER_REAP_JOB,
        config.ephemeral.viewer_reap_interval,
        FnTask::new(move || {
            let tracker = tracker.clone();
            let now = clock.now();
            async move { tracker.reap_stale_viewers(now).await.map(|_| ()) }
        }),
    )?;

    Ok(())
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("key_prefix", &self.config.store.key_prefix)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
