//! Write-Behind Counters
//!
//! High-frequency increments (listing views, clicks) land in the key-value
//! store and are pushed to the durable store in aggregated deltas by a
//! scheduled flush.
//!
//! ```text
//! increment ─► INCRBY ctr:{name}:{id} ─► SADD ctr_dirty:{name}
//!
//! flush (scheduler) ─► for id in dirty:
//!                        SREM dirty id
//!                        GETDEL ctr:{name}:{id}      (atomic read-and-clear)
//!                        durable.update_counter(id, delta)
//!                        on failure: INCRBY + SADD   (retry next cycle)
//! ```

mod buffer;
#[cfg(test)]
mod proptest;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use buffer::{CounterBuffer, CounterStats, FlushReport};

/// Counter name used for listing views
pub const VIEW_COUNTER: &str = "views";

/// Write-behind counter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Interval between scheduled flushes
    #[serde(with = "crate::config::duration_str")]
    pub flush_interval: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
        }
    }
}
