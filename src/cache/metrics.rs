//! Cache Metrics Collection
//!
//! Lock-free counters shared by the cache core and its read-path
//! accelerators. The ops server turns snapshots into Prometheus gauges.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Core
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    serialization_errors: AtomicU64,
    compressed_writes: AtomicU64,
    bytes_saved: AtomicU64,

    // Store read latency (microseconds, exponential moving average)
    read_latency_us: AtomicU64,

    // Stale-while-revalidate
    swr_stale_serves: AtomicU64,
    swr_refreshes_started: AtomicU64,
    swr_refreshes_failed: AtomicU64,

    // Prefetch
    prefetch_scheduled: AtomicU64,
    prefetch_skipped: AtomicU64,
    prefetch_failed: AtomicU64,

    // Batch
    batch_source_calls: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_serialization_error(&self) {
        self.serialization_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a compressed write and how much it saved
    pub fn record_compressed_write(&self, raw_len: usize, stored_len: usize) {
        self.compressed_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_saved
            .fetch_add(raw_len.saturating_sub(stored_len) as u64, Ordering::Relaxed);
    }

    pub fn record_stale_serve(&self) {
        self.swr_stale_serves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_started(&self) {
        self.swr_refreshes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failed(&self) {
        self.swr_refreshes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_scheduled(&self) {
        self.prefetch_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_skipped(&self) {
        self.prefetch_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_failed(&self) {
        self.prefetch_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_source_call(&self) {
        self.batch_source_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.read_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .read_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn bypasses(&self) -> u64 {
        self.bypasses.load(Ordering::Relaxed)
    }

    pub fn read_latency(&self) -> Duration {
        Duration::from_micros(self.read_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            bypasses: self.bypasses(),
            serialization_errors: self.serialization_errors.load(Ordering::Relaxed),
            compressed_writes: self.compressed_writes.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            read_latency: self.read_latency(),
            swr_stale_serves: self.swr_stale_serves.load(Ordering::Relaxed),
            swr_refreshes_started: self.swr_refreshes_started.load(Ordering::Relaxed),
            swr_refreshes_failed: self.swr_refreshes_failed.load(Ordering::Relaxed),
            prefetch_scheduled: self.prefetch_scheduled.load(Ordering::Relaxed),
            prefetch_skipped: self.prefetch_skipped.load(Ordering::Relaxed),
            prefetch_failed: self.prefetch_failed.load(Ordering::Relaxed),
            batch_source_calls: self.batch_source_calls.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.bypasses,
            &self.serialization_errors,
            &self.compressed_writes,
            &self.bytes_saved,
            &self.read_latency_us,
            &self.swr_stale_serves,
            &self.swr_refreshes_started,
            &self.swr_refreshes_failed,
            &self.prefetch_scheduled,
            &self.prefetch_skipped,
            &self.prefetch_failed,
            &self.batch_source_calls,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub serialization_errors: u64,
    pub compressed_writes: u64,
    pub bytes_saved: u64,
    pub read_latency: Duration,

    pub swr_stale_serves: u64,
    pub swr_refreshes_started: u64,
    pub swr_refreshes_failed: u64,

    pub prefetch_scheduled: u64,
    pub prefetch_skipped: u64,
    pub prefetch_failed: u64,

    pub batch_source_calls: u64,
}

impl CacheMetricsSnapshot {
    /// Hits over lookups that reached the store
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
