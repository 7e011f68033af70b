//! Coordination Events
//!
//! Immutable records of state changes that connected clients care about.
//! They are handed to an [`EventPublisher`](super::ports::EventPublisher),
//! typically a broadcaster that fans out to live connections.
//!
//! # Example
//!
//! ```ignore
//! let event = CoordinationEvent::viewer_count_changed("listing-42", 7);
//! publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::PresenceState;

/// Event emitted by the coordination layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinationEvent {
    // =========================================================================
    // Real-time Events
    // =========================================================================
    /// Number of live viewers in a room changed.
    ViewerCountChanged {
        room: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A subject started or stopped typing in a scope.
    TypingChanged {
        scope: String,
        subject: String,
        typing: bool,
        timestamp: DateTime<Utc>,
    },

    /// A subject's presence changed.
    PresenceChanged {
        subject: String,
        state: PresenceState,
        timestamp: DateTime<Utc>,
    },

    /// A subject's unread counters changed.
    UnreadChanged {
        subject: String,
        scope: Option<String>,
        count: i64,
        total: i64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Background Job Events
    // =========================================================================
    /// An item's deadline passed and its durable status moved to expired.
    ItemExpired {
        item_id: String,
        expired_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A write-behind counter flush completed.
    CountersFlushed {
        counter: String,
        entities: usize,
        total_delta: i64,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CoordinationEvent::ViewerCountChanged { timestamp, .. } => *timestamp,
            CoordinationEvent::TypingChanged { timestamp, .. } => *timestamp,
            CoordinationEvent::PresenceChanged { timestamp, .. } => *timestamp,
            CoordinationEvent::UnreadChanged { timestamp, .. } => *timestamp,
            CoordinationEvent::ItemExpired { timestamp, .. } => *timestamp,
            CoordinationEvent::CountersFlushed { timestamp, .. } => *timestamp,
        }
    }

    /// Replace the timestamp, e.g. with the scheduling clock's `now`.
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        match &mut self {
            CoordinationEvent::ViewerCountChanged { timestamp, .. }
            | CoordinationEvent::TypingChanged { timestamp, .. }
            | CoordinationEvent::PresenceChanged { timestamp, .. }
            | CoordinationEvent::UnreadChanged { timestamp, .. }
            | CoordinationEvent::ItemExpired { timestamp, .. }
            | CoordinationEvent::CountersFlushed { timestamp, .. } => *timestamp = at,
        }
        self
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            CoordinationEvent::ViewerCountChanged { .. } => "ViewerCountChanged",
            CoordinationEvent::TypingChanged { .. } => "TypingChanged",
            CoordinationEvent::PresenceChanged { .. } => "PresenceChanged",
            CoordinationEvent::UnreadChanged { .. } => "UnreadChanged",
            CoordinationEvent::ItemExpired { .. } => "ItemExpired",
            CoordinationEvent::CountersFlushed { .. } => "CountersFlushed",
        }
    }

    /// Routing key for fan-out: the room, scope, subject or item the event concerns.
    pub fn channel(&self) -> &str {
        match self {
            CoordinationEvent::ViewerCountChanged { room, .. } => room,
            CoordinationEvent::TypingChanged { scope, .. } => scope,
            CoordinationEvent::PresenceChanged { subject, .. } => subject,
            CoordinationEvent::UnreadChanged { subject, .. } => subject,
            CoordinationEvent::ItemExpired { item_id, .. } => item_id,
            CoordinationEvent::CountersFlushed { counter, .. } => counter,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl CoordinationEvent {
    pub fn viewer_count_changed(room: impl Into<String>, count: usize) -> Self {
        CoordinationEvent::ViewerCountChanged {
            room: room.into(),
            count,
            timestamp: Utc::now(),
        }
    }

    pub fn typing_changed(scope: impl Into<String>, subject: impl Into<String>, typing: bool) -> Self {
        CoordinationEvent::TypingChanged {
            scope: scope.into(),
            subject: subject.into(),
            typing,
            timestamp: Utc::now(),
        }
    }

    pub fn presence_changed(subject: impl Into<String>, state: PresenceState) -> Self {
        CoordinationEvent::PresenceChanged {
            subject: subject.into(),
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn unread_changed(
        subject: impl Into<String>,
        scope: Option<&str>,
        count: i64,
        total: i64,
    ) -> Self {
        CoordinationEvent::UnreadChanged {
            subject: subject.into(),
            scope: scope.map(str::to_string),
            count,
            total,
            timestamp: Utc::now(),
        }
    }

    pub fn item_expired(item_id: impl Into<String>, expired_at: DateTime<Utc>) -> Self {
        CoordinationEvent::ItemExpired {
            item_id: item_id.into(),
            expired_at,
            timestamp: Utc::now(),
        }
    }

    pub fn counters_flushed(
        counter: impl Into<String>,
        entities: usize,
        total_delta: i64,
        failed: usize,
    ) -> Self {
        CoordinationEvent::CountersFlushed {
            counter: counter.into(),
            entities,
            total_delta,
            failed,
            timestamp: Utc::now(),
        }
    }
}
