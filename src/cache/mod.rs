//! Read-Path Cache
//!
//! Get-or-compute caching over the shared key-value store, plus three
//! accelerators built on top of it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  StaleWhileRevalidate   │  PrefetchCoordinator  │  BatchFetcher  │
//! │  (soft/hard TTL,        │  (page N+1 in the     │  (one mget,    │
//! │   single-flight)        │   background)         │   one source)  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                          CacheCore                               │
//! │   serde_json ──► LZ4 above threshold ──► envelope ──► store.set  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Degraded Mode
//!
//! A store outage never fails a read. `get_or_compute` falls through to the
//! compute function, batch reads go straight to the source, and a malformed
//! entry is dropped and treated as a miss.

mod batch;
mod cache_core;
mod entry;
mod metrics;
mod prefetch;
#[cfg(test)]
mod proptest;
mod swr;
pub mod compression;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use cache_core::CacheCore;
pub use batch::BatchFetcher;
pub use compression::{CompressionAlgorithm, PayloadCompressor};
pub use entry::{CacheEnvelope, CachedValue};
pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use prefetch::PrefetchCoordinator;
pub use swr::StaleWhileRevalidate;

/// Default compression threshold (1 KiB)
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when a caller does not pass one
    #[serde(with = "crate::config::duration_str")]
    pub default_ttl: Duration,

    /// Payloads strictly larger than this many bytes are compressed
    pub compression_threshold: usize,

    /// LZ4 high-compression level
    pub compression_level: i32,

    /// Stale-while-revalidate freshness window
    #[serde(with = "crate::config::duration_str")]
    pub soft_ttl: Duration,

    /// Stale-while-revalidate eviction (store TTL)
    #[serde(with = "crate::config::duration_str")]
    pub hard_ttl: Duration,

    /// TTL of prefetched pages
    #[serde(with = "crate::config::duration_str")]
    pub prefetch_ttl: Duration,

    /// Full page length; a shorter page is the last one
    pub page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            compression_level: 4,
            soft_ttl: Duration::from_secs(60),
            hard_ttl: Duration::from_secs(3600),
            prefetch_ttl: Duration::from_secs(300),
            page_size: 20,
        }
    }
}
