//! Medicine timer subscriber
//!
//! Consumes medication events from a durable NATS JetStream work queue, checks
//! each one against a dosing schedule at the current wall-clock time and
//! raises a reminder when a dose is due. Every message is acknowledged or
//! rejected exactly once, one message at a time.

pub mod config;
pub mod consumer;
pub mod error;
pub mod event_schema;
pub mod notification;
pub mod processor;
pub mod retry;
pub mod schedule;

#[cfg(test)]
mod test_utilities;

pub use config::{NotificationSinkKind, SubscriberConfig};
pub use consumer::{
    connect, connect_until_shutdown, Delivery, DeliveryHandler, JetStreamBroker, MessageConsumer,
    QueueBroker, StreamExit,
};
pub use error::{NotificationError, ScheduleError, SubscriberError};
pub use event_schema::{decode, DecodeError, MedicationEvent};
pub use notification::{MonitorSink, NatsNotificationSink, NotificationSink};
pub use processor::{
    Clock, ConsumptionOutcome, Disposition, FixedClock, LocalClock, MedicationProcessor, Rejection,
};
pub use retry::{retry_with_backoff, RetryConfig};
pub use schedule::{DoseTime, DosingSchedule, MatchPolicy, ScheduleMatcher, ScheduledMedicine};
