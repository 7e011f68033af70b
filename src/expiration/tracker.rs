//! Expiration Tracker
//!
//! One sorted set per namespace holds every pending deadline:
//!
//! ```text
//!   {prefix}:exp:offers
//!   ┌──────────────┬─────────────────┐
//!   │ member       │ score (ms)      │
//!   ├──────────────┼─────────────────┤
//!   │ offer-17     │ 1717000000000   │  ◄── reap(now) pops from the top
//!   │ offer-4      │ 1717000030000   │
//!   │ offer-9      │ 1717000090000   │
//!   └──────────────┴─────────────────┘
//! ```
//!
//! Every mutation is one store command. `extend` only rescores members that
//! are still present, so an item popped by a concurrent reap is never
//! brought back, and two reapers never receive the same item.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::clock::SharedClock;
use crate::domain::KeyValueStore;
use crate::error::Result;

/// An item whose deadline passed, as returned by [`ExpirationTracker::reap`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredItem {
    pub item_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Deadline index for one namespace of items
pub struct ExpirationTracker {
    namespace: String,
    key: String,
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    batch_limit: Option<usize>,
}

impl ExpirationTracker {
    pub fn new(
        namespace: impl Into<String>,
        key_prefix: &str,
        store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            key: format!("{}:exp:{}", key_prefix, namespace),
            namespace,
            store,
            clock,
            batch_limit: None,
        }
    }

    /// Cap how many items one [`reap`](Self::reap) pops
    pub fn with_batch_limit(mut self, limit: Option<usize>) -> Self {
        self.batch_limit = limit.filter(|l| *l > 0);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Register (or overwrite) the deadline of `item_id`
    pub async fn track(&self, item_id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.store
            .zadd(&self.key, item_id, to_score(expires_at))
            .await?;
        debug!(namespace = %self.namespace, item_id, %expires_at, "Tracking expiration");
        Ok(())
    }

    /// Move the deadline of a tracked item.
    ///
    /// Returns `false` when the item is no longer tracked (already reaped or
    /// untracked); it is not re-added.
    pub async fn extend(&self, item_id: &str, new_expires_at: DateTime<Utc>) -> Result<bool> {
        let updated = self
            .store
            .zupdate_score(&self.key, item_id, to_score(new_expires_at))
            .await?;
        if !updated {
            debug!(namespace = %self.namespace, item_id, "Extend ignored, item not tracked");
        }
        Ok(updated)
    }

    /// Atomically pop every item due at `now`, oldest deadline first.
    ///
    /// Concurrent reaps never return the same id twice.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredItem>> {
        let popped = self
            .store
            .zpop_by_score(&self.key, to_score(now), self.batch_limit)
            .await?;

        Ok(popped
            .into_iter()
            .map(|(item_id, score)| ExpiredItem {
                item_id,
                expires_at: from_score(score),
            })
            .collect())
    }

    /// [`reap`](Self::reap) at the scheduling clock's current time
    pub async fn reap_due(&self) -> Result<Vec<ExpiredItem>> {
        self.reap(self.clock.now()).await
    }

    /// Stop tracking an item that ended for another reason (accepted,
    /// cancelled). Returns whether it was tracked.
    pub async fn untrack(&self, item_id: &str) -> Result<bool> {
        self.store.zrem(&self.key, item_id).await
    }

    pub async fn is_tracked(&self, item_id: &str) -> Result<bool> {
        Ok(self.store.zscore(&self.key, item_id).await?.is_some())
    }

    pub async fn expires_at(&self, item_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.store.zscore(&self.key, item_id).await?.map(from_score))
    }

    /// Items tracked, due or not
    pub async fn pending_count(&self) -> Result<usize> {
        self.store.zcard(&self.key).await
    }

    /// Items whose deadline is at or before `now`
    pub async fn due_count(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .store
            .zrange_by_score(&self.key, f64::NEG_INFINITY, to_score(now))
            .await?
            .len())
    }
}

impl std::fmt::Debug for ExpirationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationTracker")
            .field("namespace", &self.namespace)
            .field("key", &self.key)
            .field("batch_limit", &self.batch_limit)
            .finish()
    }
}

fn to_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

fn from_score(score: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(score as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
