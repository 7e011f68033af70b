//! Real-time Event Hooks
//!
//! Thin facade over an [`EventPublisher`] with one method per hook the
//! broadcaster consumes. Publishing is best effort: a failed publish is
//! logged and never reaches the caller that changed state. Every event is
//! stamped with the hooks' clock so timestamps agree with the scores the
//! trackers write.

use std::sync::Arc;

use tracing::warn;

use super::events::CoordinationEvent;
use crate::clock::{SharedClock, SystemClock};
use super::ports::{EventPublisher, PresenceState};

#[derive(Clone)]
pub struct RealtimeHooks {
    publisher: Arc<dyn EventPublisher>,
    clock: SharedClock,
}

impl RealtimeHooks {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher,
            clock: SystemClock::shared(),
        }
    }

    /// Stamp events with `clock` instead of the wall clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn on_viewer_count_changed(&self, room: &str, count: usize) {
        self.emit(CoordinationEvent::viewer_count_changed(room, count))
            .await;
    }

    pub async fn on_typing_changed(&self, scope: &str, subject: &str, typing: bool) {
        self.emit(CoordinationEvent::typing_changed(scope, subject, typing))
            .await;
    }

    pub async fn on_presence_changed(&self, subject: &str, state: PresenceState) {
        self.emit(CoordinationEvent::presence_changed(subject, state))
            .await;
    }

    pub async fn on_unread_changed(&self, subject: &str, scope: Option<&str>, count: i64, total: i64) {
        self.emit(CoordinationEvent::unread_changed(subject, scope, count, total))
            .await;
    }

    /// Publish any event, logging instead of failing.
    pub async fn emit(&self, event: CoordinationEvent) {
        let event = event.stamped(self.clock.now());
        let event_type = event.event_type();
        if let Err(e) = self.publisher.publish(event).await {
            warn!(event_type, error = %e, "Failed to publish coordination event");
        }
    }
}

impl std::fmt::Debug for RealtimeHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeHooks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryEventCollector;
    use crate::clock::{Clock, ManualClock};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn publish(&self, event: CoordinationEvent) -> Result<()> {
            Err(Error::Publish {
                event_type: event.event_type().to_string(),
                reason: "broker down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_hooks_publish_events() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let hooks = RealtimeHooks::new(collector.clone());

        hooks.on_viewer_count_changed("room", 2).await;
        hooks.on_typing_changed("c1", "u1", true).await;
        hooks.on_presence_changed("u1", PresenceState::Online).await;
        hooks.on_unread_changed("u1", Some("c1"), 1, 1).await;

        let types: Vec<_> = collector.events().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "ViewerCountChanged",
                "TypingChanged",
                "PresenceChanged",
                "UnreadChanged"
            ]
        );
    }

    #[tokio::test]
    async fn test_events_use_injected_clock() {
        let clock = ManualClock::starting_now();
        let collector = Arc::new(InMemoryEventCollector::new());
        let hooks = RealtimeHooks::new(collector.clone()).with_clock(clock.clone());

        clock.advance(Duration::from_secs(3600));
        hooks.on_typing_changed("c1", "u1", true).await;

        assert_eq!(collector.events()[0].timestamp(), clock.now());
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let hooks = RealtimeHooks::new(Arc::new(FailingPublisher));
        // Must not panic or propagate
        hooks.on_viewer_count_changed("room", 1).await;
    }
}
