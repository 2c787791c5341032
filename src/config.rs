use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::SubscriberError;
use crate::retry::RetryConfig;
use crate::schedule::{DosingSchedule, MatchPolicy};

/// Where medication reminders are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSinkKind {
    /// Structured log line on the service's own output
    Monitor,
    /// JSON message on a NATS subject
    Nats,
}

impl FromStr for NotificationSinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monitor" | "log" => Ok(NotificationSinkKind::Monitor),
            "nats" => Ok(NotificationSinkKind::Nats),
            other => Err(format!("unknown notification sink '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    // Service configuration
    pub service_name: String,

    // NATS configuration
    pub nats_url: String,
    pub nats_stream_name: String,
    pub nats_subject: String,
    pub nats_consumer_name: String,
    pub ack_wait_seconds: u64,
    pub max_deliver: i64,

    // Message handling
    pub redelivery_delay_ms: u64,
    pub settle_delay_ms: u64,

    // Schedule
    pub schedule_path: Option<String>,
    pub match_tolerance_minutes: u32,

    // Notifications
    pub notification_sink: NotificationSinkKind,
    pub notification_subject: String,

    // Broker retry policy
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl SubscriberConfig {
    pub fn from_env() -> Result<Self, SubscriberError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SubscriberError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = SubscriberConfig {
            service_name: lookup("SERVICE_NAME").unwrap_or(defaults.service_name),

            // NATS configuration
            nats_url: lookup("NATS_URL").unwrap_or(defaults.nats_url),
            nats_stream_name: lookup("NATS_STREAM_NAME").unwrap_or(defaults.nats_stream_name),
            nats_subject: lookup("NATS_SUBJECT").unwrap_or(defaults.nats_subject),
            nats_consumer_name: lookup("NATS_CONSUMER_NAME")
                .unwrap_or(defaults.nats_consumer_name),
            ack_wait_seconds: parse_var(&lookup, "ACK_WAIT_SECONDS", defaults.ack_wait_seconds)?,
            max_deliver: parse_var(&lookup, "MAX_DELIVER", defaults.max_deliver)?,

            redelivery_delay_ms: parse_var(
                &lookup,
                "REDELIVERY_DELAY_MS",
                defaults.redelivery_delay_ms,
            )?,
            settle_delay_ms: parse_var(&lookup, "SETTLE_DELAY_MS", defaults.settle_delay_ms)?,

            schedule_path: lookup("SCHEDULE_PATH").filter(|path| !path.trim().is_empty()),
            match_tolerance_minutes: parse_var(
                &lookup,
                "MATCH_TOLERANCE_MINUTES",
                defaults.match_tolerance_minutes,
            )?,

            notification_sink: parse_var(
                &lookup,
                "NOTIFICATION_SINK",
                defaults.notification_sink,
            )?,
            notification_subject: lookup("NOTIFICATION_SUBJECT")
                .unwrap_or(defaults.notification_subject),

            retry_attempts: parse_var(&lookup, "RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_delay_ms: parse_var(&lookup, "RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            retry_max_delay_ms: parse_var(
                &lookup,
                "RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay_ms,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SubscriberError> {
        if self.nats_subject.trim().is_empty() {
            return Err(SubscriberError::Configuration(
                "NATS_SUBJECT must not be empty".to_string(),
            ));
        }
        if self.max_deliver == 0 || self.max_deliver < -1 {
            return Err(SubscriberError::Configuration(
                "MAX_DELIVER must be positive or -1 for unlimited".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(SubscriberError::Configuration(
                "RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        self.match_policy()?;
        Ok(())
    }

    pub fn match_policy(&self) -> Result<MatchPolicy, SubscriberError> {
        MatchPolicy::window(self.match_tolerance_minutes).map_err(|e| {
            SubscriberError::Configuration(format!("MATCH_TOLERANCE_MINUTES: {}", e))
        })
    }

    /// Schedule file when configured, the built-in schedule otherwise
    pub fn load_schedule(&self) -> Result<DosingSchedule, SubscriberError> {
        match &self.schedule_path {
            Some(path) => {
                info!("📋 Loading dosing schedule from {}", path);
                DosingSchedule::load(path)
            }
            None => {
                info!("📋 Using built-in dosing schedule");
                Ok(DosingSchedule::builtin())
            }
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.retry_attempts,
            self.retry_delay_ms,
            self.retry_max_delay_ms,
        )
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_seconds)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, SubscriberError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            SubscriberError::Configuration(format!("Invalid value '{}' for {}: {}", raw, key, e))
        }),
        None => Ok(default),
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            service_name: "medicine-timer-subscriber".to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            nats_stream_name: "medicine_timer".to_string(),
            nats_subject: "medicine_timer".to_string(),
            nats_consumer_name: "medicine_timer_processor".to_string(),
            ack_wait_seconds: 30,
            max_deliver: 5,
            redelivery_delay_ms: 5000,
            settle_delay_ms: 0,
            schedule_path: None,
            match_tolerance_minutes: 0,
            notification_sink: NotificationSinkKind::Monitor,
            notification_subject: "notifications.medicine_timer".to_string(),
            retry_attempts: 5,
            retry_delay_ms: 1000,
            retry_max_delay_ms: 30000,
        }
    }
}
