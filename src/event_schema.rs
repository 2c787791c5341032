use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Medication timing event published on the medicine timer queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MedicationEvent {
    /// Opaque identifier of the patient the event belongs to
    pub id: String,
    /// Event timestamp exactly as the publisher sent it
    #[serde(rename = "datetime")]
    pub occurred_at: String,
    pub medicine: String,
}

/// Reasons a raw payload is not a usable medication event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {reason}")]
    Malformed { reason: String },

    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("field `{field}` must not be empty")]
    EmptyField { field: &'static str },
}

/// Identifiers are opaque; numeric ids are carried as their decimal text.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl From<WireId> for String {
    fn from(id: WireId) -> Self {
        match id {
            WireId::Text(text) => text,
            WireId::Signed(n) => n.to_string(),
            WireId::Unsigned(n) => n.to_string(),
        }
    }
}

/// Wire shape: every field optional so absence is reported per field.
#[derive(Deserialize)]
struct WireMedicationEvent {
    id: Option<WireId>,
    datetime: Option<String>,
    medicine: Option<String>,
}

/// Decode one raw queue payload into a [`MedicationEvent`].
pub fn decode(raw: &[u8]) -> Result<MedicationEvent, DecodeError> {
    let wire: WireMedicationEvent =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed {
            reason: e.to_string(),
        })?;

    let id: String = wire
        .id
        .ok_or(DecodeError::MissingField { field: "id" })?
        .into();
    let occurred_at = wire
        .datetime
        .ok_or(DecodeError::MissingField { field: "datetime" })?;
    let medicine = wire
        .medicine
        .ok_or(DecodeError::MissingField { field: "medicine" })?;

    if medicine.trim().is_empty() {
        return Err(DecodeError::EmptyField { field: "medicine" });
    }

    Ok(MedicationEvent {
        id,
        occurred_at,
        medicine,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_medication_event() {
        let raw = payload(json!({
            "id": "p1",
            "datetime": "2024-01-01T08:00",
            "medicine": "paracetamol"
        }));

        let event = decode(&raw).unwrap();

        assert_eq!(
            event,
            MedicationEvent {
                id: "p1".to_string(),
                occurred_at: "2024-01-01T08:00".to_string(),
                medicine: "paracetamol".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_keeps_delimiters_inside_values() {
        let raw = payload(json!({
            "id": "ward 3, bed 12: {left}",
            "datetime": "Mon, 01 Jan 2024 08:00:00",
            "medicine": "paracetamol: 500mg, oral"
        }));

        let event = decode(&raw).unwrap();

        assert_eq!(event.id, "ward 3, bed 12: {left}");
        assert_eq!(event.occurred_at, "Mon, 01 Jan 2024 08:00:00");
        assert_eq!(event.medicine, "paracetamol: 500mg, oral");
    }

    #[test]
    fn test_decode_numeric_id() {
        let raw = payload(json!({"id": 42, "datetime": "x", "medicine": "insulina"}));
        assert_eq!(decode(&raw).unwrap().id, "42");
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let raw = payload(json!({
            "id": "p1",
            "datetime": "2024-01-01T08:00",
            "medicine": "ibuprofeno",
            "device": "xiaomi-band"
        }));
        assert_eq!(decode(&raw).unwrap().medicine, "ibuprofeno");
    }

    #[test]
    fn test_decode_missing_medicine() {
        let raw = payload(json!({"id": "p1", "datetime": "2024-01-01T08:00"}));
        assert_eq!(
            decode(&raw),
            Err(DecodeError::MissingField { field: "medicine" })
        );
    }

    #[test]
    fn test_decode_null_field_is_missing() {
        let raw = payload(json!({"id": null, "datetime": "x", "medicine": "insulina"}));
        assert_eq!(decode(&raw), Err(DecodeError::MissingField { field: "id" }));
    }

    #[test]
    fn test_decode_empty_medicine() {
        let raw = payload(json!({"id": "p1", "datetime": "x", "medicine": "   "}));
        assert_eq!(
            decode(&raw),
            Err(DecodeError::EmptyField { field: "medicine" })
        );
    }

    #[test]
    fn test_decode_rejects_legacy_delimited_text() {
        let raw = b"{'id': 'p1', 'datetime': '08:00', 'medicine': 'paracetamol'}";
        let err = decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert!(err.to_string().starts_with("malformed payload"));
    }

    #[test]
    fn test_decode_rejects_non_object_and_invalid_utf8() {
        assert!(matches!(
            decode(b"[1, 2, 3]"),
            Err(DecodeError::Malformed { .. })
        ));
        assert!(matches!(
            decode(&[0xff, 0xfe, 0x00]),
            Err(DecodeError::Malformed { .. })
        ));
        assert!(matches!(decode(b""), Err(DecodeError::Malformed { .. })));
    }

    proptest! {
        #[test]
        fn decode_recovers_original_fields(
            id in ".*",
            occurred_at in ".*",
            medicine in "[a-zA-Z,:{}' ]*[a-zA-Z][a-zA-Z,:{}' ]*",
        ) {
            let event = MedicationEvent { id, occurred_at, medicine };
            let raw = serde_json::to_vec(&event).unwrap();

            let first = decode(&raw).unwrap();
            let second = decode(&raw).unwrap();

            prop_assert_eq!(&first, &event);
            prop_assert_eq!(first, second);
        }
    }
}
