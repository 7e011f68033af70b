//! Ephemeral Session State
//!
//! Four state families on the shared key-value store:
//!
//! | Family   | Keys                                         | Lifetime                     |
//! |----------|----------------------------------------------|------------------------------|
//! | viewers  | `viewers:{room}` zset scored by last-seen + `viewer_rooms` | reaped after `viewer_timeout` |
//! | typing   | `typing:{scope}:{subject}` + `typing_in:{scope}` | TTL (`typing_ttl`)       |
//! | presence | `presence:{subject}`                         | TTL, refreshed by heartbeat  |
//! | unread   | `unread:{subject}:total` + per-scope keys    | until reset                  |
//!
//! Ids are escaped with [`escape_key_part`] before they become key
//! segments, so a `:` inside a room, scope or subject never aliases another
//! key. A missing typing or presence key is the negative state: no tombstones,
//! no stop signal. Every change is pushed through [`RealtimeHooks`]. Store
//! failures degrade to inactive reads and logged no-op writes; nothing here
//! touches the durable store.

mod presence;
mod typing;
mod unread;
mod viewers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::SharedClock;
use crate::domain::{escape_key_part, KeyValueStore, RealtimeHooks};
use crate::error::Error;

/// Ephemeral state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralConfig {
    /// How long a typing indicator lives without a refresh
    #[serde(with = "crate::config::duration_str")]
    pub typing_ttl: Duration,

    /// How long presence lives without a heartbeat
    #[serde(with = "crate::config::duration_str")]
    pub presence_ttl: Duration,

    /// Viewers not touched within this window are reaped
    #[serde(with = "crate::config::duration_str")]
    pub viewer_timeout: Duration,

    /// Interval of the stale-viewer reap job
    #[serde(with = "crate::config::duration_str")]
    pub viewer_reap_interval: Duration,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_secs(3),
            presence_ttl: Duration::from_secs(300),
            viewer_timeout: Duration::from_secs(90),
            viewer_reap_interval: Duration::from_secs(30),
        }
    }
}

/// Unread counters of one subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadCounts {
    pub total: i64,
    pub by_scope: BTreeMap<String, i64>,
}

/// Presence, typing, viewer membership and unread counters
pub struct EphemeralStateTracker {
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    hooks: RealtimeHooks,
    config: EphemeralConfig,
    key_prefix: String,
}

impl EphemeralStateTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
        hooks: RealtimeHooks,
        key_prefix: impl Into<String>,
        config: EphemeralConfig,
    ) -> Self {
        Self {
            store,
            clock,
            hooks,
            config,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn config(&self) -> &EphemeralConfig {
        &self.config
    }

    pub fn hooks(&self) -> &RealtimeHooks {
        &self.hooks
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.key_prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(&escape_key_part(part));
        }
        key
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Log a failed store call and fall back to `default`
    fn degrade<T>(&self, operation: &str, result: Result<T, Error>, default: T) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(operation, error = %e, "Ephemeral state degraded");
                default
            }
        }
    }
}

impl std::fmt::Debug for EphemeralStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralStateTracker")
            .field("key_prefix", &self.key_prefix)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
struct Fixture {
    tracker: EphemeralStateTracker,
    store: Arc<crate::adapters::InMemoryKeyValueStore>,
    clock: Arc<crate::clock::ManualClock>,
    events: Arc<crate::adapters::InMemoryEventCollector>,
}

#[cfg(test)]
fn fixture() -> Fixture {
    use crate::adapters::{InMemoryEventCollector, InMemoryKeyValueStore};
    use crate::clock::ManualClock;

    let clock = ManualClock::starting_now();
    let store = Arc::new(InMemoryKeyValueStore::new(clock.clone()));
    let events = Arc::new(InMemoryEventCollector::new());
    let tracker = EphemeralStateTracker::new(
        store.clone(),
        clock.clone(),
        RealtimeHooks::new(events.clone()).with_clock(clock.clone()),
        "test",
        EphemeralConfig::default(),
    );
    Fixture {
        tracker,
        store,
        clock,
        events,
    }
}
