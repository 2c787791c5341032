//! In-memory doubles for the broker, its deliveries and the notification sink

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::consumer::{Delivery, QueueBroker};
use crate::error::{NotificationError, SubscriberError};
use crate::notification::NotificationSink;
use crate::processor::{Disposition, Rejection};

pub fn payload(id: &str, datetime: &str, medicine: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({"id": id, "datetime": datetime, "medicine": medicine})).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkCall {
    pub message: String,
    pub event_timestamp: String,
    pub patient_id: String,
}

#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(
        &self,
        message: &str,
        event_timestamp: &str,
        patient_id: &str,
    ) -> Result<(), NotificationError> {
        self.calls.lock().unwrap().push(SinkCall {
            message: message.to_string(),
            event_timestamp: event_timestamp.to_string(),
            patient_id: patient_id.to_string(),
        });
        if self.fail {
            return Err(NotificationError::Publish("monitor unavailable".into()));
        }
        Ok(())
    }
}

/// Shared log of how deliveries were settled, in order
pub type SettlementLog = Arc<Mutex<Vec<(String, Disposition)>>>;

pub struct FakeDelivery {
    pub label: String,
    pub payload: Vec<u8>,
    pub log: SettlementLog,
    pub fail_settlement: bool,
}

impl FakeDelivery {
    pub fn new(label: &str, payload: Vec<u8>, log: &SettlementLog) -> Self {
        Self {
            label: label.to_string(),
            payload,
            log: log.clone(),
            fail_settlement: false,
        }
    }

    fn record(&self, disposition: Disposition) -> Result<(), SubscriberError> {
        self.log
            .lock()
            .unwrap()
            .push((self.label.clone(), disposition));
        if self.fail_settlement {
            return Err(SubscriberError::Acknowledgement("connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for FakeDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), SubscriberError> {
        self.record(Disposition::Ack)
    }

    async fn reject(&self, rejection: Rejection) -> Result<(), SubscriberError> {
        self.record(Disposition::Reject(rejection))
    }
}

/// One opened message stream: the items it yields before ending
pub type Session = Vec<Result<FakeDelivery, String>>;

/// Broker that serves scripted sessions and counts lifecycle calls
#[derive(Default)]
pub struct FakeBroker {
    sessions: Mutex<VecDeque<Session>>,
    /// Declarations that fail before one succeeds
    pub declare_failures: u32,
    /// Never finish declaring the queue
    pub declare_hangs: bool,
    declares: AtomicU32,
    opens: AtomicU32,
    closes: AtomicU32,
}

impl FakeBroker {
    /// Once the scripted sessions run out, opened streams stay idle
    pub fn with_sessions(sessions: Vec<Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            ..Default::default()
        }
    }

    pub fn declares(&self) -> u32 {
        self.declares.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueBroker for Arc<FakeBroker> {
    type Queue = ();
    type Message = FakeDelivery;
    type ReceiveError = String;
    type Messages = BoxStream<'static, Result<FakeDelivery, String>>;

    async fn declare_queue(&self) -> Result<(), SubscriberError> {
        let attempt = self.declares.fetch_add(1, Ordering::SeqCst) + 1;
        if self.declare_hangs {
            futures::future::pending::<()>().await;
        }
        if attempt <= self.declare_failures {
            return Err(SubscriberError::StreamSetup("stream unavailable".into()));
        }
        Ok(())
    }

    async fn open_messages(&self, _queue: &()) -> Result<Self::Messages, SubscriberError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.sessions.lock().unwrap().pop_front();
        Ok(match next {
            Some(session) => stream::iter(session).boxed(),
            None => stream::pending().boxed(),
        })
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
