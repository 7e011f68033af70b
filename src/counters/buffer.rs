//! Counter Buffer
//!
//! Increments are absorbed by the key-value store and reach the durable
//! store as one aggregated delta per entity and flush cycle.
//!
//! ```text
//!   increment(id, n)              flush()
//!   ────────────────              ───────
//!   INCRBY ctr:views:id n         for id in SMEMBERS ctr_dirty:views
//!   SADD   ctr_dirty:views id       SREM   ctr_dirty:views id
//!                                   GETDEL ctr:views:id        ──► delta
//!                                   durable.update_counter(id, delta)
//!                                   on error: INCRBY delta + SADD id
//! ```
//!
//! The dirty marker is always written after the increment and removed
//! before the read-and-clear, so a delta is either flushed in this cycle
//! or still marked for the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::SharedClock;
use crate::domain::{escape_key_part, CoordinationEvent, DurableStore, KeyValueStore, RealtimeHooks};
use crate::error::{Error, Result};

const DIRTY_MARK_ATTEMPTS: u32 = 3;
const DIRTY_MARK_BACKOFF: Duration = Duration::from_millis(5);

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Entities whose delta reached the durable store
    pub entities: usize,
    /// Sum of applied deltas
    pub total_delta: i64,
    /// Entities left buffered for the next cycle
    pub failed: usize,
}

/// Cumulative buffer statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CounterStats {
    pub increments: u64,
    pub dropped: u64,
    /// Deltas left without a dirty marker; picked up by the entity's next increment
    pub stranded: u64,
    pub flushed_entities: u64,
    pub flushed_total: i64,
    pub failures: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StatsInner {
    increments: AtomicU64,
    dropped: AtomicU64,
    stranded: AtomicU64,
    flushed_entities: AtomicU64,
    flushed_total: std::sync::atomic::AtomicI64,
    failures: AtomicU64,
    last_flush_at: RwLock<Option<DateTime<Utc>>>,
}

// =============================================================================
// Counter Buffer
// =============================================================================

/// Buffered additive counter for one counter name (e.g. `views`)
pub struct CounterBuffer {
    name: String,
    key_prefix: String,
    store: Arc<dyn KeyValueStore>,
    durable: Arc<dyn DurableStore>,
    clock: SharedClock,
    hooks: Option<RealtimeHooks>,
    stats: StatsInner,
}

impl CounterBuffer {
    pub fn new(
        name: impl Into<String>,
        key_prefix: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        durable: Arc<dyn DurableStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            key_prefix: key_prefix.into(),
            store,
            durable,
            clock,
            hooks: None,
            stats: StatsInner::default(),
        }
    }

    /// Publish a `CountersFlushed` event after every non-empty flush
    pub fn with_hooks(mut self, hooks: RealtimeHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn counter_key(&self, entity_id: &str) -> String {
        format!("{}:ctr:{}:{}", self.key_prefix, self.name, escape_key_part(entity_id))
    }

    fn dirty_key(&self) -> String {
        format!("{}:ctr_dirty:{}", self.key_prefix, self.name)
    }

    // =========================================================================
    // Foreground
    // =========================================================================

    /// Buffer `amount` for `entity_id`.
    ///
    /// Never fails: when the store is unreachable the increment is dropped,
    /// logged and counted. Returns the buffered total when it was recorded.
    ///
    /// The dirty marker is written after the increment so a concurrent flush
    /// never clears a key that is not in the dirty set. If the marker cannot
    /// be written after a few attempts the increment is rolled back and
    /// reported as dropped. Only when the rollback fails too is the delta
    /// left unmarked; it is counted as stranded and flushed after the
    /// entity's next successful increment.
    pub async fn increment(&self, entity_id: &str, amount: i64) -> Option<i64> {
        if amount == 0 {
            return None;
        }

        let key = self.counter_key(entity_id);
        let buffered = match self.store.incr_by(&key, amount).await {
            Ok(total) => total,
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(counter = %self.name, entity_id, error = %e, "Dropping counter increment");
                return None;
            }
        };

        if self.mark_dirty(entity_id).await {
            self.stats.increments.fetch_add(1, Ordering::Relaxed);
            return Some(buffered);
        }

        match self.store.incr_by(&key, -amount).await {
            Ok(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(counter = %self.name, entity_id, "Dirty marker unavailable, increment rolled back");
                None
            }
            Err(e) => {
                self.stats.increments.fetch_add(1, Ordering::Relaxed);
                self.stats.stranded.fetch_add(1, Ordering::Relaxed);
                error!(
                    counter = %self.name,
                    entity_id,
                    amount,
                    error = %e,
                    "Counter delta stranded without dirty marker until the next increment"
                );
                Some(buffered)
            }
        }
    }

    /// Add `entity_id` to the dirty set, retrying briefly
    async fn mark_dirty(&self, entity_id: &str) -> bool {
        let dirty_key = self.dirty_key();
        for attempt in 1..=DIRTY_MARK_ATTEMPTS {
            match self.store.sadd(&dirty_key, entity_id).await {
                Ok(_) => return true,
                Err(e) => {
                    debug!(counter = %self.name, entity_id, attempt, error = %e, "Dirty marker write failed");
                    if attempt < DIRTY_MARK_ATTEMPTS {
                        tokio::time::sleep(DIRTY_MARK_BACKOFF * attempt).await;
                    }
                }
            }
        }
        false
    }

    /// Unflushed amount for `entity_id`
    pub async fn pending(&self, entity_id: &str) -> Result<i64> {
        let key = self.counter_key(entity_id);
        match self.store.get(&key).await? {
            Some(raw) => parse_amount(&key, &raw),
            None => Ok(0),
        }
    }

    /// Durable `baseline` plus whatever is still buffered.
    ///
    /// A store outage reads as nothing buffered.
    pub async fn current_count(&self, entity_id: &str, baseline: i64) -> i64 {
        match self.pending(entity_id).await {
            Ok(pending) => baseline + pending,
            Err(e) => {
                debug!(counter = %self.name, entity_id, error = %e, "Pending read failed");
                baseline
            }
        }
    }

    /// Number of entities with buffered deltas
    pub async fn dirty_count(&self) -> Result<usize> {
        self.store.scard(&self.dirty_key()).await
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Push every buffered delta to the durable store.
    ///
    /// Each entity is handled on its own: a failed durable write restores
    /// that entity's delta for the next cycle and the rest proceed. Only a
    /// failure to list dirty entities fails the whole cycle.
    #[instrument(skip(self), fields(counter = %self.name))]
    pub async fn flush(&self) -> Result<FlushReport> {
        let started = Instant::now();
        let dirty_key = self.dirty_key();
        let entities = self.store.smembers(&dirty_key).await?;

        let mut report = FlushReport::default();
        for entity_id in entities {
            match self.flush_entity(&dirty_key, &entity_id).await {
                Ok(0) => {}
                Ok(delta) => {
                    report.entities += 1;
                    report.total_delta += delta;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(counter = %self.name, entity_id = %entity_id, error = %e, "Counter flush failed for entity");
                }
            }
        }

        self.record_flush(&report);
        if report.entities > 0 || report.failed > 0 {
            info!(
                "Flushed {} counter deltas for {} entities in {:?} ({} failed)",
                report.total_delta,
                report.entities,
                started.elapsed(),
                report.failed
            );
            if let Some(hooks) = &self.hooks {
                hooks
                    .emit(CoordinationEvent::counters_flushed(
                        &self.name,
                        report.entities,
                        report.total_delta,
                        report.failed,
                    ))
                    .await;
            }
        }

        Ok(report)
    }

    /// Move one entity's delta to the durable store. Returns the applied
    /// delta (0 when nothing was buffered).
    async fn flush_entity(&self, dirty_key: &str, entity_id: &str) -> Result<i64> {
        let key = self.counter_key(entity_id);

        self.store.srem(dirty_key, entity_id).await?;
        let raw = match self.store.get_and_delete(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.remark_dirty(dirty_key, entity_id).await;
                return Err(e);
            }
        };

        let delta = match raw {
            Some(raw) => parse_amount(&key, &raw)?,
            None => return Ok(0),
        };
        if delta == 0 {
            return Ok(0);
        }

        if let Err(e) = self.durable.update_counter(entity_id, delta).await {
            self.restore(dirty_key, entity_id, delta).await;
            return Err(Error::FlushPartialFailure {
                counter: self.name.clone(),
                entity_id: entity_id.to_string(),
                reason: e.to_string(),
            });
        }

        debug!(counter = %self.name, entity_id, delta, "Counter delta applied");
        Ok(delta)
    }

    /// Put a cleared delta back for the next cycle
    async fn restore(&self, dirty_key: &str, entity_id: &str, delta: i64) {
        if let Err(e) = self.store.incr_by(&self.counter_key(entity_id), delta).await {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(counter = %self.name, entity_id, delta, error = %e, "Failed to restore counter delta, delta lost");
            return;
        }
        self.remark_dirty(dirty_key, entity_id).await;
    }

    async fn remark_dirty(&self, dirty_key: &str, entity_id: &str) {
        if let Err(e) = self.store.sadd(dirty_key, entity_id).await {
            warn!(counter = %self.name, entity_id, error = %e, "Failed to re-mark counter dirty");
        }
    }

    fn record_flush(&self, report: &FlushReport) {
        self.stats
            .flushed_entities
            .fetch_add(report.entities as u64, Ordering::Relaxed);
        self.stats
            .flushed_total
            .fetch_add(report.total_delta, Ordering::Relaxed);
        self.stats
            .failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        *self.stats.last_flush_at.write() = Some(self.clock.now());
    }

    pub fn stats(&self) -> CounterStats {
        CounterStats {
            increments: self.stats.increments.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            stranded: self.stats.stranded.load(Ordering::Relaxed),
            flushed_entities: self.stats.flushed_entities.load(Ordering::Relaxed),
            flushed_total: self.stats.flushed_total.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            last_flush_at: *self.stats.last_flush_at.read(),
        }
    }
}

impl std::fmt::Debug for CounterBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterBuffer")
            .field("name", &self.name)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

fn parse_amount(key: &str, raw: &Bytes) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::WrongType {
            key: key.to_string(),
            reason: "counter value is not an integer".to_string(),
        })
}

// =============================================================================
// Tests
// =============================================================================
