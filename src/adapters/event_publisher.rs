//! Event Publisher Adapters
//!
//! Implements the `EventPublisher` port with various backends.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::domain::events::CoordinationEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Logging-based event publisher.
///
/// Publishes events to the tracing/logging system. Useful for development
/// and as an audit trail next to a real broadcaster.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventPublisher {
    /// Create a new logging event publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a publisher that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: CoordinationEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(event_type = %event_type, event = %json, "Coordination event");
        } else {
            debug!(event_type = %event_type, event = %json, "Coordination event");
        }

        Ok(())
    }
}

/// In-memory event collector for testing.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<CoordinationEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<CoordinationEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<CoordinationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: CoordinationEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<CoordinationEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Fan-out publisher for live connections.
///
/// Each connection handler calls [`subscribe`](Self::subscribe) and forwards
/// the events it cares about (see [`CoordinationEvent::channel`]). Publishing
/// with no subscribers is not an error; disconnected clients simply miss
/// events.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<CoordinationEvent>,
}

impl BroadcastEventPublisher {
    /// Create a broadcaster buffering up to `capacity` events per lagging receiver
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: CoordinationEvent) -> Result<()> {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!(event_type = event.event_type(), "No live subscribers for event");
        }
        Ok(())
    }
}

/// Composite event publisher that publishes to multiple backends.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Box<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a publisher to the composite.
    pub fn with_publisher<P: EventPublisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Box::new(publisher));
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: CoordinationEvent) -> Result<()> {
        for publisher in &self.publishers {
            publisher.publish(event.clone()).await?;
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<CoordinationEvent>) -> Result<()> {
        for publisher in &self.publishers {
            publisher.publish_all(events.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_publisher() {
        let publisher = LoggingEventPublisher::new();
        let event = CoordinationEvent::viewer_count_changed("room-1", 2);

        // Should not panic
        publisher.publish(event).await.unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_collector() {
        let collector = InMemoryEventCollector::new();

        assert!(collector.is_empty());

        collector
            .publish(CoordinationEvent::typing_changed("c1", "u1", true))
            .await
            .unwrap();
        collector
            .publish(CoordinationEvent::viewer_count_changed("room-1", 1))
            .await
            .unwrap();

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.events_of_type("TypingChanged").len(), 1);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let publisher = BroadcastEventPublisher::new(16);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        let event = CoordinationEvent::viewer_count_changed("room-1", 5);
        publisher.publish(event.clone()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let publisher = BroadcastEventPublisher::default();
        publisher
            .publish(CoordinationEvent::viewer_count_changed("room-1", 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_composite_publisher() {
        let broadcaster = BroadcastEventPublisher::new(4);
        let mut rx = broadcaster.subscribe();
        let composite = CompositeEventPublisher::new()
            .with_publisher(LoggingEventPublisher::debug_level())
            .with_publisher(broadcaster);

        let event = CoordinationEvent::typing_changed("c1", "u1", false);
        composite.publish(event.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
