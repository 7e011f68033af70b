//! Domain Ports (Port/Adapter Pattern)
//!
//! The coordination layer depends on three collaborators it does not own:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Coordination Layer                         │
//! │   CacheCore │ CounterBuffer │ ExpirationTracker │ Ephemeral    │
//! └───────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//!   KeyValueStore         DurableStore           EventPublisher
//!   (shared, atomic ops)  (relational writes)    (live broadcast)
//! ```
//!
//! Adapters in [`crate::adapters`] implement these traits.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::events::CoordinationEvent;

// =============================================================================
// Value Objects
// =============================================================================

/// Lifecycle status of a time-bounded item (offer, reservation, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Active,
    Expired,
    Accepted,
    Cancelled,
}

impl ItemStatus {
    /// Every status but `Active` ends the item's lifecycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ItemStatus::Active)
    }

    /// Outcome of moving an item from `self` to `next`.
    ///
    /// Only an `Active` item can change status. Repeating the current status
    /// is a duplicate signal; anything else on a terminal item is rejected,
    /// so a late `Expired` never overwrites `Accepted` or `Cancelled`.
    pub fn transition_to(&self, next: ItemStatus) -> StatusTransition {
        if *self == next {
            StatusTransition::Unchanged
        } else if self.is_terminal() {
            StatusTransition::Rejected { current: *self }
        } else {
            StatusTransition::Applied
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Active => write!(f, "active"),
            ItemStatus::Expired => write!(f, "expired"),
            ItemStatus::Accepted => write!(f, "accepted"),
            ItemStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a durable status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    /// The record moved to the new status
    Applied,
    /// The record already had that status (duplicate signal)
    Unchanged,
    /// The record already reached a different terminal status
    Rejected { current: ItemStatus },
}

/// Presence of a subject. A missing presence key reads as `Offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Online => "online",
            PresenceState::Away => "away",
            PresenceState::Busy => "busy",
            PresenceState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PresenceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(PresenceState::Online),
            "away" => Ok(PresenceState::Away),
            "busy" => Ok(PresenceState::Busy),
            "offline" => Ok(PresenceState::Offline),
            other => Err(Error::Internal(format!("unknown presence state: {}", other))),
        }
    }
}

/// Escape a caller-supplied id for use as one `:`-separated key segment.
///
/// `%` and `:` are percent-encoded so `("a:b", "c")` and `("a", "b:c")`
/// never build the same key.
pub fn escape_key_part(part: &str) -> Cow<'_, str> {
    if !part.contains([':', '%']) {
        return Cow::Borrowed(part);
    }
    let mut escaped = String::with_capacity(part.len() + 4);
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

// =============================================================================
// Key-Value Store Port
// =============================================================================

/// Shared key-value store.
///
/// Every method is a single atomic operation against the store; there are
/// no multi-operation transactions. Sorted-set scores are `f64` and, where
/// they represent time, hold epoch milliseconds. Implementations return
/// [`Error::StoreUnavailable`] for transient outages.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    // ---- strings ----------------------------------------------------------

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Read several values in one round trip, in key order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>>;

    /// Write a value, replacing any previous one. `ttl = None` never expires.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key of any type. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check whether a live key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Add `delta` to an integer value (missing = 0) and return the result.
    /// An existing TTL is kept.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Set a TTL on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically read and remove a value.
    async fn get_and_delete(&self, key: &str) -> Result<Option<Bytes>>;

    // ---- sorted sets ------------------------------------------------------

    /// Insert or rescore a member. Returns true if the member is new.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool>;

    /// Rescore a member only if it is already present.
    async fn zupdate_score(&self, key: &str, member: &str, score: f64) -> Result<bool>;

    /// Score of a member.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;

    /// Remove a member. Returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Number of members.
    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>>;

    /// Atomically remove and return members with `score <= max`, ascending,
    /// at most `limit` of them.
    async fn zpop_by_score(
        &self,
        key: &str,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>>;

    // ---- sets -------------------------------------------------------------

    /// Add a member. Returns true if it was new.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a member. Returns whether it was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// All members, unordered.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Number of members.
    async fn scard(&self, key: &str) -> Result<usize>;

    /// Membership test.
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    // ---- health -----------------------------------------------------------

    /// Round-trip check.
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// Durable Store Port
// =============================================================================

/// Relational persistence layer, owned by the application.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Apply one additive counter update.
    async fn update_counter(&self, entity_id: &str, delta: i64) -> Result<()>;

    /// Transition an item's status as one conditional write.
    ///
    /// Implementations must follow [`ItemStatus::transition_to`]: the write
    /// applies only while the stored status is `Active` (or the item is
    /// unknown). Repeating the current status returns `Unchanged` and a
    /// different terminal status returns `Rejected` without writing. The
    /// reaper and `complete_item` race on the same item; this rule decides
    /// the winner.
    async fn update_status(&self, item_id: &str, status: ItemStatus) -> Result<StatusTransition>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for pushing change notifications to live connections.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: CoordinationEvent) -> Result<()>;

    /// Publish several events.
    async fn publish_all(&self, events: Vec<CoordinationEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
