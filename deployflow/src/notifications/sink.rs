//! Notification sink trait and simple implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::core::{EventType, NotificationEvent, RunId};

/// Receives terminal run events.
///
/// Publishing never fails: delivery errors are handled (and logged) by the
/// sink so a run transition is never blocked by a subscriber.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publishes an event to every subscriber of its pipeline.
    async fn publish(&self, event: &NotificationEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotificationSink;

#[async_trait]
impl NotificationSink for NoOpNotificationSink {
    async fn publish(&self, _event: &NotificationEvent) {}
}

/// A sink that logs events using the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn publish(&self, event: &NotificationEvent) {
        info!(
            event_id = %event.event_id,
            run_id = %event.run_id,
            pipeline_id = %event.pipeline_id,
            event_type = %event.event_type,
            payload = %event.payload,
            "Run notification"
        );
    }
}

/// A collecting sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingNotificationSink {
    events: RwLock<Vec<NotificationEvent>>,
}

impl CollectingNotificationSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events published for `run_id`.
    #[must_use]
    pub fn events_for(&self, run_id: RunId) -> Vec<NotificationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Returns the types of the events published for `run_id`, in order.
    #[must_use]
    pub fn event_types_for(&self, run_id: RunId) -> Vec<EventType> {
        self.events
            .read()
            .iter()
            .filter(|e| e.run_id == run_id)
            .map(|e| e.event_type)
            .collect()
    }

    /// Returns events of one type.
    #[must_use]
    pub fn events_of_type(&self, event_type: EventType) -> Vec<NotificationEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl NotificationSink for CollectingNotificationSink {
    async fn publish(&self, event: &NotificationEvent) {
        self.events.write().push(event.clone());
    }
}
