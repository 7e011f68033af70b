//! MarketCache - Caching and Real-Time Coordination Layer
//!
//! Reconciles high-churn application state (view counters, time-bounded
//! offers, live viewers, typing and unread indicators) held in a shared
//! key-value store with a durable relational store, under eventual
//! consistency and without per-item timers.
//!
//! # Architecture
//!
//! ```text
//!   foreground requests                      connection layer
//!          │                                        │
//!          ▼                                        ▼
//!  ┌───────────────────────┐   ┌──────────────┐   ┌─────────────────────┐
//!  │ CacheCore             │   │ CounterBuffer│   │ EphemeralState      │
//!  │  + SWR/Prefetch/Batch │   │ Expiration   │   │ (viewers, typing,   │
//!  └───────────────────────┘   │ Tracker      │   │  presence, unread)  │
//!          │                   └──────────────┘   └─────────────────────┘
//!          │                          │                      │
//!          ▼                          ▼                      ▼
//!  ┌────────────────────────────────────────────────────────────────────┐
//!  │                 KeyValueStore (bounded per-op timeout)              │
//!  └────────────────────────────────────────────────────────────────────┘
//!                                     ▲
//!               Scheduler: flush / reap / cleanup jobs
//!                                     │
//!                                     ▼
//!                DurableStore (update_counter, update_status)
//!                EventPublisher (live broadcast)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory store, timeout decorator, durable and publisher adapters
//! - [`cache`] - Get-or-compute cache with compression, SWR, prefetch, batching
//! - [`clock`] - The single scheduling clock
//! - [`config`] - YAML configuration
//! - [`coordinator`] - Facade wiring every component and the standard jobs
//! - [`counters`] - Write-behind counter buffer
//! - [`domain`] - Ports, events and real-time hooks
//! - [`ephemeral`] - Viewer, typing, presence and unread state
//! - [`error`] - Error types
//! - [`expiration`] - Time-ordered expiration tracker and reaper
//! - [`ops`] - Health, status and Prometheus endpoints
//! - [`scheduler`] - Recurring background jobs

pub mod adapters;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod domain;
pub mod ephemeral;
pub mod error;
pub mod expiration;
pub mod ops;
pub mod scheduler;

// Re-export commonly used types
pub use cache::{CacheCore, StaleWhileRevalidate};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::CoordinationConfig;
pub use coordinator::Coordinator;
pub use counters::CounterBuffer;
pub use domain::{CoordinationEvent, DurableStore, EventPublisher, KeyValueStore};
pub use ephemeral::EphemeralStateTracker;
pub use error::{Error, Result};
pub use expiration::{ExpirationReaper, ExpirationTracker};
pub use scheduler::{JobStatus, Scheduler};
