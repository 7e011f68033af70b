//! Infrastructure Adapters
//!
//! Concrete implementations of the ports in [`crate::domain::ports`].
//!
//! # Available Adapters
//!
//! - [`InMemoryKeyValueStore`] - `KeyValueStore` on sharded in-process maps
//! - [`TimeoutStore`] - per-operation timeout decorator for any store
//! - [`InMemoryDurableStore`] / [`LoggingDurableStore`] - `DurableStore` stand-ins
//! - [`LoggingEventPublisher`], [`InMemoryEventCollector`],
//!   [`BroadcastEventPublisher`], [`CompositeEventPublisher`] - `EventPublisher`

mod durable;
mod event_publisher;
mod memory_store;
mod timeout_store;

pub use durable::{InMemoryDurableStore, LoggingDurableStore};
pub use event_publisher::{
    BroadcastEventPublisher, CompositeEventPublisher, InMemoryEventCollector,
    LoggingEventPublisher,
};
pub use memory_store::{InMemoryKeyValueStore, MemoryStoreStats};
pub use timeout_store::TimeoutStore;
