//! Time-Ordered Expiration
//!
//! Deadlines for time-bounded items (offers, reservations) live in one
//! sorted set per namespace, scored by `expires_at` in epoch milliseconds.
//! There are no per-item timers: a scheduled reaper pops everything due.
//!
//! ```text
//! track / extend ──► ZADD / ZUPDATE  {prefix}:exp:{namespace}
//!
//! reaper (scheduler) ──► ZPOP score <= now   (atomic, each id once)
//!                    ──► durable.update_status(id, Expired)
//!                          Applied   ─► ItemExpired event
//!                          Unchanged ─► duplicate signal, ignored
//!                          Rejected  ─► already accepted/cancelled, superseded
//!                          Err       ─► re-track, retry next cycle
//! ```

mod reaper;
mod tracker;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use reaper::{ExpirationReaper, ReapReport, ReaperStats};
pub use tracker::{ExpirationTracker, ExpiredItem};

/// Namespace used for marketplace offers
pub const OFFER_NAMESPACE: &str = "offers";

/// Expiration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    /// Interval between scheduled reaps
    #[serde(with = "crate::config::duration_str")]
    pub reap_interval: Duration,

    /// Most items popped per reap; `None` pops everything due
    pub reap_batch_limit: Option<usize>,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(10),
            reap_batch_limit: Some(500),
        }
    }
}
