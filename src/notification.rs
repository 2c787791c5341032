//! Notification sinks for medication reminders
//!
//! A sink receives the reminder text, the event timestamp and the patient id
//! for every event that falls on a dosing time. Rendering and delivery are the
//! sink's concern; the consumer only cares whether the hand-off succeeded.

use async_nats::Client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::NotificationError;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        message: &str,
        event_timestamp: &str,
        patient_id: &str,
    ) -> Result<(), NotificationError>;
}

/// Reminder record published to downstream monitors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationNotification {
    pub notification_id: Uuid,
    pub patient_id: String,
    pub message: String,
    pub event_timestamp: String,
    pub raised_at: DateTime<Utc>,
}

impl MedicationNotification {
    pub fn new(message: &str, event_timestamp: &str, patient_id: &str) -> Self {
        Self {
            notification_id: Uuid::new_v4(),
            patient_id: patient_id.to_string(),
            message: message.to_string(),
            event_timestamp: event_timestamp.to_string(),
            raised_at: Utc::now(),
        }
    }
}

/// Writes reminders to the service log, standing in for a console monitor
#[derive(Debug, Default, Clone)]
pub struct MonitorSink;

impl MonitorSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for MonitorSink {
    async fn notify(
        &self,
        message: &str,
        event_timestamp: &str,
        patient_id: &str,
    ) -> Result<(), NotificationError> {
        info!(
            target: "medicine_timer_subscriber::monitor",
            patient_id,
            event_timestamp,
            "🔔 {}",
            message
        );
        Ok(())
    }
}

/// Publishes reminders as JSON on a NATS subject
#[derive(Clone)]
pub struct NatsNotificationSink {
    client: Client,
    subject: String,
}

impl NatsNotificationSink {
    pub fn new(client: Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for NatsNotificationSink {
    async fn notify(
        &self,
        message: &str,
        event_timestamp: &str,
        patient_id: &str,
    ) -> Result<(), NotificationError> {
        let notification = MedicationNotification::new(message, event_timestamp, patient_id);
        let bytes = serde_json::to_vec(&notification)?;

        self.client
            .publish(self.subject.clone(), bytes.into())
            .await
            .map_err(|e| NotificationError::Publish(format!("Failed to publish reminder: {}", e)))?;
        self.client
            .flush()
            .await
            .map_err(|e| NotificationError::Publish(format!("Failed to flush reminder: {}", e)))?;

        debug!(
            notification_id = %notification.notification_id,
            subject = %self.subject,
            "Published medication reminder"
        );
        Ok(())
    }
}
