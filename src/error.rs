//! Error types for the medicine timer subscriber

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream setup error: {0}")]
    StreamSetup(String),

    #[error("Acknowledgement error: {0}")]
    Acknowledgement(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SubscriberError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubscriberError::Connection(_) | SubscriberError::StreamSetup(_)
        )
    }
}

/// Failures raised by a notification sink
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish error: {0}")]
    Publish(String),
}

/// Invalid dosing schedule definitions
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid dosing time '{0}', expected HH:MM")]
    InvalidTime(String),

    #[error("Medicine name must not be empty")]
    EmptyName,

    #[error("Medicine '{0}' has no dosing times")]
    NoDoseTimes(String),

    #[error("Medicine '{first}' and '{second}' normalise to the same name")]
    DuplicateMedicine { first: String, second: String },

    #[error("Match tolerance of {0} minutes must be below 720")]
    InvalidTolerance(u32),

    #[error("Schedule parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
