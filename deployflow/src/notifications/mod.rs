//! Run notifications.
//!
//! Terminal run transitions produce a [`NotificationEvent`](crate::core::NotificationEvent)
//! that is published to a [`NotificationSink`]. The production sink,
//! [`FanoutNotificationSink`], delivers each event to the subscribers of the
//! run's pipeline with bounded retries.

mod fanout;
mod retry;
mod sink;

pub use fanout::{FanoutNotificationSink, LoggingSubscriber, Subscriber};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use sink::{
    CollectingNotificationSink, LoggingNotificationSink, NoOpNotificationSink, NotificationSink,
};
