//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the key-value store, the
//!   durable relational store and the live-event broadcaster
//! - **Events** (`events.rs`) - Change notifications pushed to connected clients
//! - **Hooks** (`hooks.rs`) - Best-effort `on_*_changed` publishing facade
//!
//! # Usage
//!
//! ```ignore
//! use marketcache::domain::{DurableStore, ItemStatus, KeyValueStore};
//!
//! async fn expire<S, D>(store: &S, durable: &D, item_id: &str) -> Result<()>
//! where
//!     S: KeyValueStore,
//!     D: DurableStore,
//! {
//!     store.zrem("mc:exp:offers", item_id).await?;
//!     durable.update_status(item_id, ItemStatus::Expired).await?;
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod hooks;
pub mod ports;

pub use events::CoordinationEvent;
pub use hooks::RealtimeHooks;
pub use ports::{
    escape_key_part, DurableStore, EventPublisher, ItemStatus, KeyValueStore, PresenceState,
    StatusTransition,
};
