//! Turns one raw queue payload into a consumption outcome
//!
//! decode -> match against the schedule at the current wall-clock time ->
//! notify on a match. The outcome alone decides how the message is settled.

use chrono::{Local, NaiveTime};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::event_schema::decode;
use crate::notification::NotificationSink;
use crate::schedule::{DosingSchedule, ScheduleMatcher};

/// Terminal result of processing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionOutcome {
    Notified,
    NoMatch,
    Malformed,
    ProcessingError,
}

impl ConsumptionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumptionOutcome::Notified => "notified",
            ConsumptionOutcome::NoMatch => "no_match",
            ConsumptionOutcome::Malformed => "malformed",
            ConsumptionOutcome::ProcessingError => "processing_error",
        }
    }

    /// How the broker should settle a message that ended with this outcome
    pub fn disposition(&self, redelivery_delay: Duration) -> Disposition {
        match self {
            ConsumptionOutcome::Notified | ConsumptionOutcome::NoMatch => Disposition::Ack,
            ConsumptionOutcome::Malformed => Disposition::Reject(Rejection::Terminate),
            ConsumptionOutcome::ProcessingError => Disposition::Reject(Rejection::Redeliver {
                delay: redelivery_delay,
            }),
        }
    }
}

impl fmt::Display for ConsumptionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Never redeliver; the broker dead-letters the message
    Terminate,
    /// Requeue for another attempt after `delay`
    Redeliver { delay: Duration },
}

/// Source of the wall-clock time of day
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveTime {
        Local::now().time()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveTime {
        self.0
    }
}

pub struct MedicationProcessor {
    schedule: Arc<DosingSchedule>,
    matcher: ScheduleMatcher,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl MedicationProcessor {
    pub fn new(
        schedule: Arc<DosingSchedule>,
        matcher: ScheduleMatcher,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            schedule,
            matcher,
            sink,
            clock,
        }
    }

    pub async fn process(&self, payload: &[u8]) -> ConsumptionOutcome {
        let event = match decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(reason = %e, payload_len = payload.len(), "Rejecting malformed medication event");
                return ConsumptionOutcome::Malformed;
            }
        };

        let now = self.clock.now();
        let Some(due) = self.matcher.due_medicine(&self.schedule, &event.medicine, now) else {
            debug!(
                patient_id = %event.id,
                medicine = %event.medicine,
                time = %now.format("%H:%M"),
                "No dose due"
            );
            return ConsumptionOutcome::NoMatch;
        };

        let message = due.reminder_message();
        match self.sink.notify(&message, &event.occurred_at, &event.id).await {
            Ok(()) => {
                info!(
                    patient_id = %event.id,
                    medicine = %due.name,
                    "💊 Medication reminder raised"
                );
                ConsumptionOutcome::Notified
            }
            Err(e) => {
                error!(
                    patient_id = %event.id,
                    medicine = %due.name,
                    error = %e,
                    "Failed to raise medication reminder"
                );
                ConsumptionOutcome::ProcessingError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::MatchPolicy;
    use crate::test_utilities::{payload, RecordingSink};
    use pretty_assertions::assert_eq;

    fn processor_at(hour: u32, minute: u32, sink: Arc<RecordingSink>) -> MedicationProcessor {
        MedicationProcessor::new(
            Arc::new(DosingSchedule::builtin()),
            ScheduleMatcher::new(MatchPolicy::exact()),
            sink,
            Arc::new(FixedClock(NaiveTime::from_hms_opt(hour, minute, 0).unwrap())),
        )
    }

    #[test]
    fn test_disposition_per_outcome() {
        let delay = Duration::from_secs(5);

        assert_eq!(ConsumptionOutcome::Notified.disposition(delay), Disposition::Ack);
        assert_eq!(ConsumptionOutcome::NoMatch.disposition(delay), Disposition::Ack);
        assert_eq!(
            ConsumptionOutcome::Malformed.disposition(delay),
            Disposition::Reject(Rejection::Terminate)
        );
        assert_eq!(
            ConsumptionOutcome::ProcessingError.disposition(delay),
            Disposition::Reject(Rejection::Redeliver { delay })
        );
    }

    #[tokio::test]
    async fn test_due_medicine_is_notified() {
        let sink = Arc::new(RecordingSink::default());
        let processor = processor_at(16, 0, sink.clone());

        let outcome = processor
            .process(&payload("p9", "2024-03-01T16:00", "Paracetamol"))
            .await;

        assert_eq!(outcome, ConsumptionOutcome::Notified);
        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].patient_id, "p9");
        assert_eq!(calls[0].event_timestamp, "2024-03-01T16:00");
        assert_eq!(calls[0].message, "The patient must take paracetamol");
    }

    #[tokio::test]
    async fn test_accented_medicine_is_notified() {
        let sink = Arc::new(RecordingSink::default());
        let processor = processor_at(20, 0, sink.clone());

        let outcome = processor.process(&payload("p2", "t", "ínsulina")).await;

        assert_eq!(outcome, ConsumptionOutcome::Notified);
        assert_eq!(sink.calls()[0].message, "The patient must take insulina");
    }

    #[tokio::test]
    async fn test_unknown_medicine_is_no_match() {
        let sink = Arc::new(RecordingSink::default());
        let processor = processor_at(8, 0, sink.clone());

        let outcome = processor.process(&payload("p1", "t", "aspirina")).await;

        assert_eq!(outcome, ConsumptionOutcome::NoMatch);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_skips_sink() {
        let sink = Arc::new(RecordingSink::default());
        let processor = processor_at(8, 0, sink.clone());

        let outcome = processor.process(b"{'id': 'p1', 'medicine': 'paracetamol'}").await;

        assert_eq!(outcome, ConsumptionOutcome::Malformed);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_is_processing_error() {
        let sink = Arc::new(RecordingSink::failing());
        let processor = processor_at(8, 0, sink.clone());

        let outcome = processor.process(&payload("p1", "t", "paracetamol")).await;

        assert_eq!(outcome, ConsumptionOutcome::ProcessingError);
        assert_eq!(sink.calls().len(), 1);
    }
}
