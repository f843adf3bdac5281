//! Wire codec between the domain entities in [`crate::types`] and a broker
//! record, which is a flat mapping of string fields (every Redis Streams
//! field is a string on the wire, which is why this crate never treats a
//! broker record as typed JSON without an explicit parse step).
//!
//! Outbound, every entity is serialized into the canonical **payload-wrapped**
//! shape: a `type` discriminant, the entity JSON-encoded under `payload`, and
//! a handful of duplicated top-level scalars (`session_uid`, `meeting_id`,
//! `message_id` where applicable) so broker-level tooling can filter a
//! stream without deserializing JSON.
//!
//! Inbound, a stage accepts either that payload-wrapped shape or a flat
//! field-per-key shape (the entity's scalar fields directly at the top
//! level, no `type`/`payload` keys) — probed for by checking for a
//! `payload` key first. Both shapes must be accepted for one release per
//! the design notes' forward-compatibility requirement. Flat-shape parsing
//! is per-entity (each field's string is parsed against its real type)
//! since a generic string-keyed map cannot be deserialized directly into a
//! struct with numeric or enum fields.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::types::{Audio, AudioFormat, AudioMetadata, Command, PatternKind, Reply, Segment};

pub type Fields = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: String },
    #[error("failed to decode payload JSON: {0}")]
    PayloadJson(#[source] serde_json::Error),
    #[error("failed to encode entity to JSON: {0}")]
    EncodeJson(#[source] serde_json::Error),
}

/// Type discriminant written into outbound records' `type` field.
pub trait EntityKind {
    const KIND: &'static str;
}

impl EntityKind for Segment {
    const KIND: &'static str = "segment";
}
impl EntityKind for Command {
    const KIND: &'static str = "command";
}
impl EntityKind for Reply {
    const KIND: &'static str = "reply";
}
impl EntityKind for Audio {
    const KIND: &'static str = "audio";
}

/// Parses an entity from the legacy flat (field-per-key, all-string)
/// broker record shape.
pub trait FromFlatFields: Sized {
    fn from_flat(fields: &Fields) -> Result<Self, CodecError>;
}

fn field<'a>(fields: &'a Fields, key: &str) -> Result<&'a str, CodecError> {
    fields
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| CodecError::MissingField(key.to_string()))
}

fn parse_field<T: std::str::FromStr>(fields: &Fields, key: &str) -> Result<T, CodecError> {
    let raw = field(fields, key)?;
    raw.parse()
        .map_err(|_| CodecError::InvalidValue { field: key.to_string(), value: raw.to_string() })
}

impl FromFlatFields for Segment {
    fn from_flat(fields: &Fields) -> Result<Self, CodecError> {
        Ok(Self {
            text: field(fields, "text")?.to_string(),
            session_uid: field(fields, "session_uid")?.to_string(),
            meeting_id: field(fields, "meeting_id")?.to_string(),
            segment_start_s: parse_field(fields, "segment_start_s")?,
            segment_end_s: parse_field(fields, "segment_end_s")?,
            timestamp: field(fields, "timestamp")?.to_string(),
        })
    }
}

impl FromFlatFields for Command {
    fn from_flat(fields: &Fields) -> Result<Self, CodecError> {
        let pattern_kind: PatternKind = field(fields, "pattern_kind")?
            .parse()
            .map_err(|_| CodecError::InvalidValue {
                field: "pattern_kind".to_string(),
                value: field(fields, "pattern_kind").unwrap_or_default().to_string(),
            })?;
        Ok(Self {
            question: field(fields, "question")?.to_string(),
            session_uid: field(fields, "session_uid")?.to_string(),
            meeting_id: field(fields, "meeting_id")?.to_string(),
            context: field(fields, "context")?.to_string(),
            confidence: parse_field(fields, "confidence")?,
            pattern_kind,
            timestamp: field(fields, "timestamp")?.to_string(),
        })
    }
}

impl FromFlatFields for Reply {
    fn from_flat(fields: &Fields) -> Result<Self, CodecError> {
        Ok(Self {
            response: field(fields, "response")?.to_string(),
            session_uid: field(fields, "session_uid")?.to_string(),
            meeting_id: field(fields, "meeting_id")?.to_string(),
            original_question: field(fields, "original_question")?.to_string(),
            original_timestamp: field(fields, "original_timestamp")?.to_string(),
            timestamp: field(fields, "timestamp")?.to_string(),
            message_id: field(fields, "message_id")?.to_string(),
        })
    }
}

impl FromFlatFields for Audio {
    fn from_flat(fields: &Fields) -> Result<Self, CodecError> {
        let format = match field(fields, "audio_format")? {
            "mp3" => AudioFormat::Mp3,
            "wav" => AudioFormat::Wav,
            other => {
                return Err(CodecError::InvalidValue {
                    field: "audio_format".to_string(),
                    value: other.to_string(),
                })
            }
        };
        Ok(Self {
            audio_data: field(fields, "audio_data")?.to_string(),
            audio_metadata: AudioMetadata {
                format,
                size_bytes: parse_field(fields, "audio_size_bytes")?,
                duration_s: parse_field(fields, "audio_duration_s")?,
                engine: field(fields, "audio_engine")?.to_string(),
            },
            session_uid: field(fields, "session_uid")?.to_string(),
            meeting_id: field(fields, "meeting_id")?.to_string(),
            original_question: field(fields, "original_question")?.to_string(),
            response_text: field(fields, "response_text")?.to_string(),
            message_id: field(fields, "message_id")?.to_string(),
            timestamp: field(fields, "timestamp")?.to_string(),
        })
    }
}

/// Encodes an entity into the canonical payload-wrapped broker record.
///
/// `scalars` supplies the duplicated top-level fields (typically
/// `session_uid`, `meeting_id`, and `message_id` when applicable) — the
/// caller knows which fields matter for filtering better than a generic
/// serializer would.
pub fn encode<T>(entity: &T, scalars: &[(&str, &str)]) -> Result<Fields, CodecError>
where
    T: Serialize + EntityKind,
{
    let payload = serde_json::to_string(entity).map_err(CodecError::EncodeJson)?;
    let mut fields = Fields::new();
    fields.insert("type".to_string(), T::KIND.to_string());
    fields.insert("payload".to_string(), payload);
    for (key, value) in scalars {
        fields.insert((*key).to_string(), (*value).to_string());
    }
    Ok(fields)
}

/// Decodes a broker record back into an entity, accepting both the
/// payload-wrapped shape and the legacy flat shape.
pub fn decode<T>(fields: &Fields) -> Result<T, CodecError>
where
    T: DeserializeOwned + FromFlatFields,
{
    if let Some(payload) = fields.get("payload") {
        return serde_json::from_str(payload).map_err(CodecError::PayloadJson);
    }
    T::from_flat(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_command() -> Command {
        Command {
            question: "what time is it?".to_string(),
            session_uid: "S1".to_string(),
            meeting_id: "M1".to_string(),
            context: "segment 1.0-2.0s".to_string(),
            confidence: 0.9,
            pattern_kind: PatternKind::Primary,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn round_trips_through_payload_wrapped_shape() {
        let command = sample_command();
        let fields = encode(
            &command,
            &[("session_uid", &command.session_uid), ("meeting_id", &command.meeting_id)],
        )
        .unwrap();
        assert_eq!(fields.get("type").unwrap(), "command");
        assert_eq!(fields.get("session_uid").unwrap(), "S1");

        let decoded: Command = decode(&fields).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn decodes_legacy_flat_shape() {
        let mut flat = Fields::new();
        flat.insert("question".to_string(), "what time is it?".to_string());
        flat.insert("session_uid".to_string(), "S1".to_string());
        flat.insert("meeting_id".to_string(), "M1".to_string());
        flat.insert("context".to_string(), "segment 1.0-2.0s".to_string());
        flat.insert("confidence".to_string(), "0.9".to_string());
        flat.insert("pattern_kind".to_string(), "primary".to_string());
        flat.insert("timestamp".to_string(), "2026-01-01T00:00:00Z".to_string());

        let decoded: Command = decode(&flat).unwrap();
        assert_eq!(decoded, sample_command());
    }

    #[test]
    fn missing_field_reports_which_one() {
        let flat = Fields::new();
        let err = Command::from_flat(&flat).unwrap_err();
        assert!(matches!(err, CodecError::MissingField(ref f) if f == "question"));
    }

    #[test]
    fn invalid_pattern_kind_is_rejected() {
        let mut flat = Fields::new();
        flat.insert("question".to_string(), "x".to_string());
        flat.insert("session_uid".to_string(), "S1".to_string());
        flat.insert("meeting_id".to_string(), "M1".to_string());
        flat.insert("context".to_string(), "c".to_string());
        flat.insert("confidence".to_string(), "0.9".to_string());
        flat.insert("pattern_kind".to_string(), "bogus".to_string());
        flat.insert("timestamp".to_string(), "t".to_string());

        let err = Command::from_flat(&flat).unwrap_err();
        assert!(matches!(err, CodecError::InvalidValue { ref field, .. } if field == "pattern_kind"));
    }
}
