//! Expiration reaper
//!
//! Turns popped deadlines into durable status transitions. Each item is
//! handled independently; a failed durable write puts that item back into
//! the tracker so the next cycle retries it.
//!
//! A popped item can still be completed by its owner while the `Expired`
//! write is in flight. The durable store's conditional transition settles
//! that race: whichever write lands first wins and the other comes back
//! `Rejected`, which the reaper counts as superseded and does not announce.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::tracker::{ExpirationTracker, ExpiredItem};
use crate::domain::{CoordinationEvent, DurableStore, ItemStatus, RealtimeHooks, StatusTransition};
use crate::error::Result;

/// Outcome of one reap cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Items moved to `Expired`
    pub expired: usize,
    /// Items that already were `Expired` (duplicate signal)
    pub unchanged: usize,
    /// Items that already ended another way (accepted, cancelled)
    pub superseded: usize,
    /// Items whose durable write failed; re-tracked for retry
    pub failed: usize,
}

impl ReapReport {
    pub fn reaped(&self) -> usize {
        self.expired + self.unchanged + self.superseded + self.failed
    }
}

/// Cumulative reaper statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaperStats {
    pub cycles: u64,
    pub expired: u64,
    pub unchanged: u64,
    pub superseded: u64,
    pub failed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StatsInner {
    cycles: AtomicU64,
    expired: AtomicU64,
    unchanged: AtomicU64,
    superseded: AtomicU64,
    failed: AtomicU64,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
}

/// Drives due items from the tracker to the durable store
pub struct ExpirationReaper {
    tracker: Arc<ExpirationTracker>,
    durable: Arc<dyn DurableStore>,
    hooks: Option<RealtimeHooks>,
    stats: StatsInner,
}

impl ExpirationReaper {
    pub fn new(tracker: Arc<ExpirationTracker>, durable: Arc<dyn DurableStore>) -> Self {
        Self {
            tracker,
            durable,
            hooks: None,
            stats: StatsInner::default(),
        }
    }

    /// Publish `ItemExpired` for every applied transition
    pub fn with_hooks(mut self, hooks: RealtimeHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn tracker(&self) -> &Arc<ExpirationTracker> {
        &self.tracker
    }

    /// Reap at the tracker's scheduling clock
    pub async fn run_due(&self) -> Result<ReapReport> {
        let now = self.tracker.clock().now();
        self.run_once(now).await
    }

    /// Reap everything due at `now` and transition it to `Expired`.
    ///
    /// Fails only when the tracker itself cannot be read.
    #[instrument(skip(self), fields(namespace = %self.tracker.namespace()))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let started = Instant::now();
        let due = self.tracker.reap(now).await?;

        let mut report = ReapReport::default();
        for item in due {
            match self.durable.update_status(&item.item_id, ItemStatus::Expired).await {
                Ok(StatusTransition::Applied) => {
                    report.expired += 1;
                    debug!(item_id = %item.item_id, "Item expired");
                    if let Some(hooks) = &self.hooks {
                        hooks
                            .emit(CoordinationEvent::item_expired(&item.item_id, item.expires_at))
                            .await;
                    }
                }
                Ok(StatusTransition::Unchanged) => {
                    report.unchanged += 1;
                    debug!(item_id = %item.item_id, "Item already expired, ignoring duplicate");
                }
                Ok(StatusTransition::Rejected { current }) => {
                    report.superseded += 1;
                    debug!(item_id = %item.item_id, status = %current, "Item already ended, not expiring");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(item_id = %item.item_id, error = %e, "Expiration write failed, re-tracking");
                    self.retrack(&item).await;
                }
            }
        }

        self.record(&report, now);
        if report.reaped() > 0 {
            info!(
                "Reaped {} items in {:?}: {} expired, {} unchanged, {} superseded, {} failed",
                report.reaped(),
                started.elapsed(),
                report.expired,
                report.unchanged,
                report.superseded,
                report.failed
            );
        }
        Ok(report)
    }

    async fn retrack(&self, item: &ExpiredItem) {
        if let Err(e) = self.tracker.track(&item.item_id, item.expires_at).await {
            error!(
                item_id = %item.item_id,
                error = %e,
                "Failed to re-track item after durable failure, expiration lost"
            );
        }
    }

    fn record(&self, report: &ReapReport, now: DateTime<Utc>) {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.stats
            .expired
            .fetch_add(report.expired as u64, Ordering::Relaxed);
        self.stats
            .unchanged
            .fetch_add(report.unchanged as u64, Ordering::Relaxed);
        self.stats
            .superseded
            .fetch_add(report.superseded as u64, Ordering::Relaxed);
        self.stats
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        *self.stats.last_run_at.write() = Some(now);
    }

    pub fn stats(&self) -> ReaperStats {
        ReaperStats {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            unchanged: self.stats.unchanged.load(Ordering::Relaxed),
            superseded: self.stats.superseded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            last_run_at: *self.stats.last_run_at.read(),
        }
    }
}

impl std::fmt::Debug for ExpirationReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationReaper")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryDurableStore, InMemoryEventCollector, InMemoryKeyValueStore};
    use crate::clock::{Clock, ManualClock};
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Fixture {
        reaper: ExpirationReaper,
        tracker: Arc<ExpirationTracker>,
        durable: Arc<InMemoryDurableStore>,
        events: Arc<InMemoryEventCollector>,
        store: Arc<InMemoryKeyValueStore>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Fixture {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryKeyValueStore::new(clock.clone()));
        let tracker = Arc::new(ExpirationTracker::new(
            "offers",
            "test",
            store.clone(),
            clock.clone(),
        ));
        let durable = Arc::new(InMemoryDurableStore::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let reaper = ExpirationReaper::new(tracker.clone(), durable.clone())
            .with_hooks(RealtimeHooks::new(events.clone()));
        Fixture {
            reaper,
            tracker,
            durable,
            events,
            store,
            clock,
        }
    }

    #[tokio::test]
    async fn test_due_items_expire_once() {
        let f = setup();
        let now = f.clock.now();
        f.durable.insert_item("offer-1", ItemStatus::Active);
        f.tracker
            .track("offer-1", now + chrono::Duration::seconds(2))
            .await
            .unwrap();

        assert_eq!(f.reaper.run_due().await.unwrap(), ReapReport::default());

        f.clock.advance(Duration::from_secs(3));
        let report = f.reaper.run_due().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(f.durable.status("offer-1"), Some(ItemStatus::Expired));

        let report = f.reaper.run_due().await.unwrap();
        assert_eq!(report.reaped(), 0);
        assert_eq!(f.durable.status_writes(), 1);

        let events = f.events.events_of_type("ItemExpired");
        assert_eq!(events.len(), 1);
        assert_matches!(&events[0], CoordinationEvent::ItemExpired { item_id, .. } if item_id == "offer-1");
    }

    #[tokio::test]
    async fn test_duplicate_signal_is_noop() {
        let f = setup();
        let now = f.clock.now();
        f.durable.insert_item("offer", ItemStatus::Expired);
        f.tracker.track("offer", now).await.unwrap();

        let report = f.reaper.run_once(now).await.unwrap();
        assert_eq!(
            report,
            ReapReport {
                unchanged: 1,
                ..ReapReport::default()
            }
        );
        assert!(f.events.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_and_others_proceed() {
        let f = setup();
        let now = f.clock.now();
        f.durable.insert_item("ok", ItemStatus::Active);
        f.durable.insert_item("flaky", ItemStatus::Active);
        f.durable.fail_for("flaky");
        f.tracker.track("ok", now).await.unwrap();
        f.tracker.track("flaky", now).await.unwrap();

        let report = f.reaper.run_once(now).await.unwrap();
        assert_eq!(
            report,
            ReapReport {
                expired: 1,
                failed: 1,
                ..ReapReport::default()
            }
        );
        assert!(f.tracker.is_tracked("flaky").await.unwrap());

        f.durable.recover("flaky");
        let report = f.reaper.run_once(now).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(f.durable.status("flaky"), Some(ItemStatus::Expired));
        assert_eq!(f.reaper.stats().cycles, 2);
    }

    #[tokio::test]
    async fn test_completed_item_is_not_expired() {
        let f = setup();
        let now = f.clock.now();
        f.durable.insert_item("offer", ItemStatus::Active);
        f.tracker.track("offer", now).await.unwrap();

        // Completed after the deadline passed but before the reaper ran
        f.durable
            .update_status("offer", ItemStatus::Cancelled)
            .await
            .unwrap();

        let report = f.reaper.run_once(now).await.unwrap();
        assert_eq!(
            report,
            ReapReport {
                superseded: 1,
                ..ReapReport::default()
            }
        );
        assert_eq!(f.durable.status("offer"), Some(ItemStatus::Cancelled));
        assert!(f.events.is_empty());
        assert_eq!(f.reaper.stats().superseded, 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_cycle() {
        let f = setup();
        f.store.set_available(false);
        assert!(f.reaper.run_due().await.unwrap_err().is_store_unavailable());
    }
}
