//! Per-pipeline subscriber fan-out.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::sink::NotificationSink;
use crate::config::{NotificationConfig, PipelineDefinition};
use crate::core::NotificationEvent;

/// A destination for run notifications, identified by its channel.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// The channel identifier, e.g. `email:ops@example.com`.
    fn channel(&self) -> &str;

    /// Delivers one event.
    async fn deliver(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// A subscriber that writes deliveries to the log.
///
/// Used for channels without a dedicated transport.
#[derive(Debug, Clone)]
pub struct LoggingSubscriber {
    channel: String,
}

impl LoggingSubscriber {
    /// Creates a logging subscriber for `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Subscriber for LoggingSubscriber {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn deliver(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        info!(
            channel = %self.channel,
            run_id = %event.run_id,
            pipeline_id = %event.pipeline_id,
            event_type = %event.event_type,
            "Delivered notification"
        );
        Ok(())
    }
}

/// Delivers each event to every subscriber of its pipeline, concurrently,
/// retrying failed deliveries.
pub struct FanoutNotificationSink {
    subscribers: DashMap<String, Vec<Arc<dyn Subscriber>>>,
    retry: RetryPolicy,
}

impl FanoutNotificationSink {
    /// Creates a sink with no subscribers.
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            subscribers: DashMap::new(),
            retry,
        }
    }

    /// Creates a sink subscribing each definition's channels.
    #[must_use]
    pub fn from_definitions(definitions: &[PipelineDefinition], config: &NotificationConfig) -> Self {
        let sink = Self::new(RetryPolicy::from(config));
        for definition in definitions {
            sink.register(definition);
        }
        sink
    }

    /// Subscribes every channel of a pipeline definition.
    pub fn register(&self, definition: &PipelineDefinition) {
        for channel in &definition.notification_channels {
            self.subscribe(
                definition.pipeline_id.clone(),
                Arc::new(LoggingSubscriber::new(channel.clone())),
            );
        }
    }

    /// Adds a subscriber to a pipeline. A channel is subscribed at most once.
    pub fn subscribe(&self, pipeline_id: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        let pipeline_id = pipeline_id.into();
        let mut entry = self.subscribers.entry(pipeline_id.clone()).or_default();
        if entry.iter().any(|s| s.channel() == subscriber.channel()) {
            debug!(pipeline_id = %pipeline_id, channel = %subscriber.channel(), "Already subscribed");
            return;
        }
        info!(pipeline_id = %pipeline_id, channel = %subscriber.channel(), "Subscribed channel");
        entry.push(subscriber);
    }

    /// Returns the channels subscribed to a pipeline.
    #[must_use]
    pub fn channels(&self, pipeline_id: &str) -> Vec<String> {
        self.subscribers
            .get(pipeline_id)
            .map(|subs| subs.iter().map(|s| s.channel().to_string()).collect())
            .unwrap_or_default()
    }

    async fn deliver_with_retry(&self, subscriber: &dyn Subscriber, event: &NotificationEvent) {
        let mut attempt = 1;
        loop {
            match subscriber.deliver(event).await {
                Ok(()) => return,
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        channel = %subscriber.channel(),
                        run_id = %event.run_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Notification delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        channel = %subscriber.channel(),
                        run_id = %event.run_id,
                        event_type = %event.event_type,
                        attempts = attempt,
                        error = %e,
                        "Notification delivery failed"
                    );
                    return;
                }
            }
        }
    }
}

impl Default for FanoutNotificationSink {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl NotificationSink for FanoutNotificationSink {
    async fn publish(&self, event: &NotificationEvent) {
        let subscribers = self
            .subscribers
            .get(&event.pipeline_id)
            .map(|subs| subs.value().clone())
            .unwrap_or_default();

        if subscribers.is_empty() {
            debug!(pipeline_id = %event.pipeline_id, "No subscribers for notification");
            return;
        }

        join_all(
            subscribers
                .iter()
                .map(|subscriber| self.deliver_with_retry(subscriber.as_ref(), event)),
        )
        .await;
    }
}
