//! Durable Store Adapters
//!
//! The relational persistence layer is owned by the application. This
//! module provides an in-memory stand-in that records every write and can
//! be told to fail for chosen ids, plus a logging adapter for dry runs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;

use crate::domain::ports::{DurableStore, ItemStatus, StatusTransition};
use crate::error::{Error, Result};

/// In-memory [`DurableStore`].
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    counters: DashMap<String, i64>,
    statuses: DashMap<String, ItemStatus>,
    failing: RwLock<HashSet<String>>,
    counter_writes: AtomicU64,
    status_writes: AtomicU64,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable total applied to an entity so far
    pub fn counter(&self, entity_id: &str) -> i64 {
        self.counters.get(entity_id).map(|v| *v).unwrap_or(0)
    }

    /// Current status of an item
    pub fn status(&self, item_id: &str) -> Option<ItemStatus> {
        self.statuses.get(item_id).map(|s| *s)
    }

    /// Seed a record (e.g. an offer created as `Active`)
    pub fn insert_item(&self, item_id: impl Into<String>, status: ItemStatus) {
        self.statuses.insert(item_id.into(), status);
    }

    /// Make every write for `id` fail until [`recover`](Self::recover)
    pub fn fail_for(&self, id: impl Into<String>) {
        self.failing.write().insert(id.into());
    }

    pub fn recover(&self, id: &str) {
        self.failing.write().remove(id);
    }

    /// Number of successful `update_counter` calls
    pub fn counter_writes(&self) -> u64 {
        self.counter_writes.load(Ordering::Relaxed)
    }

    /// Number of successful `update_status` calls that changed a record
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::Relaxed)
    }

    fn check(&self, id: &str) -> Result<()> {
        if self.failing.read().contains(id) {
            return Err(Error::Durable {
                id: id.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn update_counter(&self, entity_id: &str, delta: i64) -> Result<()> {
        self.check(entity_id)?;
        *self.counters.entry(entity_id.to_string()).or_insert(0) += delta;
        self.counter_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn update_status(&self, item_id: &str, status: ItemStatus) -> Result<StatusTransition> {
        self.check(item_id)?;
        // The entry guard holds the shard lock, so check-and-set is atomic
        let transition = match self.statuses.entry(item_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let transition = occupied.get().transition_to(status);
                if transition == StatusTransition::Applied {
                    occupied.insert(status);
                }
                transition
            }
            Entry::Vacant(vacant) => {
                vacant.insert(status);
                StatusTransition::Applied
            }
        };
        if transition == StatusTransition::Applied {
            self.status_writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(transition)
    }
}

/// [`DurableStore`] that only logs the writes it would make.
#[derive(Debug, Clone, Default)]
pub struct LoggingDurableStore;

#[async_trait]
impl DurableStore for LoggingDurableStore {
    async fn update_counter(&self, entity_id: &str, delta: i64) -> Result<()> {
        info!(entity_id, delta, "[DRY-RUN] Would apply counter delta");
        Ok(())
    }

    async fn update_status(&self, item_id: &str, status: ItemStatus) -> Result<StatusTransition> {
        info!(item_id, status = %status, "[DRY-RUN] Would update item status");
        Ok(StatusTransition::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_accumulates() {
        let store = InMemoryDurableStore::new();
        store.update_counter("p1", 7).await.unwrap();
        store.update_counter("p1", 3).await.unwrap();
        assert_eq!(store.counter("p1"), 10);
        assert_eq!(store.counter_writes(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_status_is_noop() {
        let store = InMemoryDurableStore::new();
        store.insert_item("o1", ItemStatus::Active);

        let first = store.update_status("o1", ItemStatus::Expired).await.unwrap();
        let second = store.update_status("o1", ItemStatus::Expired).await.unwrap();

        assert_eq!(first, StatusTransition::Applied);
        assert_eq!(second, StatusTransition::Unchanged);
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_terminal_status_not_overwritten() {
        let store = InMemoryDurableStore::new();
        store.insert_item("o1", ItemStatus::Active);

        let accepted = store.update_status("o1", ItemStatus::Accepted).await.unwrap();
        let expired = store.update_status("o1", ItemStatus::Expired).await.unwrap();

        assert_eq!(accepted, StatusTransition::Applied);
        assert_eq!(
            expired,
            StatusTransition::Rejected {
                current: ItemStatus::Accepted
            }
        );
        assert_eq!(store.status("o1"), Some(ItemStatus::Accepted));
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemoryDurableStore::new();
        store.fail_for("p1");
        assert!(store.update_counter("p1", 1).await.is_err());
        store.recover("p1");
        store.update_counter("p1", 1).await.unwrap();
        assert_eq!(store.counter("p1"), 1);
    }
}
