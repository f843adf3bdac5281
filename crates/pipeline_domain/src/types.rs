use serde::{Deserialize, Serialize};

/// A transcript segment produced by the upstream speech recognizer.
///
/// Flows on the `transcripts` stream into the WakeDetector. All timestamps
/// in this crate are ISO-8601 UTC strings, matching what the recognizer
/// emits — conversion to/from `chrono::DateTime<Utc>` happens at the edges
/// that actually need arithmetic on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    pub session_uid: String,
    pub meeting_id: String,
    pub segment_start_s: f64,
    pub segment_end_s: f64,
    pub timestamp: String,
}

/// The kind of pattern that produced a wake-word hit, in descending default
/// confidence order as configured by `thresholds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Primary,
    Secondary,
    Conversational,
    Question,
    Punctuation,
    Fuzzy,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Primary => "primary",
            PatternKind::Secondary => "secondary",
            PatternKind::Conversational => "conversational",
            PatternKind::Question => "question",
            PatternKind::Punctuation => "punctuation",
            PatternKind::Fuzzy => "fuzzy",
        }
    }
}

impl std::str::FromStr for PatternKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(PatternKind::Primary),
            "secondary" => Ok(PatternKind::Secondary),
            "conversational" => Ok(PatternKind::Conversational),
            "question" => Ok(PatternKind::Question),
            "punctuation" => Ok(PatternKind::Punctuation),
            "fuzzy" => Ok(PatternKind::Fuzzy),
            other => Err(format!("unknown pattern kind: {other}")),
        }
    }
}

/// A wake-word command emitted by the WakeDetector, carrying the extracted
/// question onward to the Responder. `session_uid` and `meeting_id` are
/// carried verbatim from the originating Segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub question: String,
    pub session_uid: String,
    pub meeting_id: String,
    pub context: String,
    pub confidence: f32,
    pub pattern_kind: PatternKind,
    pub timestamp: String,
}

/// An LLM reply emitted by the Responder. `meeting_id` is always a string
/// here regardless of what type it arrived as further upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub response: String,
    pub session_uid: String,
    pub meeting_id: String,
    pub original_question: String,
    pub original_timestamp: String,
    pub timestamp: String,
    pub message_id: String,
}

/// Audio format produced by the Synthesizer's TTS gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }
}

/// Descriptive metadata attached to every Audio record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub format: AudioFormat,
    pub size_bytes: usize,
    pub duration_s: f64,
    pub engine: String,
}

/// A synthesized reply, ready for bot-side playback. `audio_data` is
/// base64-encoded so it can ride verbatim through a text-field broker
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audio {
    pub audio_data: String,
    pub audio_metadata: AudioMetadata,
    pub session_uid: String,
    pub meeting_id: String,
    pub original_question: String,
    pub response_text: String,
    pub message_id: String,
    pub timestamp: String,
}

impl Audio {
    /// Per §3: valid iff both `audio_data` and `message_id` are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.audio_data.is_empty() && !self.message_id.is_empty()
    }
}

/// In-process binding between a bot's recognizer connection and the session
/// it is currently serving. Never persisted to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub connection_id: String,
    pub recognizer_session_uid: Option<String>,
    pub meeting_id: Option<String>,
}

impl SessionBinding {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            recognizer_session_uid: None,
            meeting_id: None,
        }
    }

    /// Per §4.4: an Audio is admitted iff its `session_uid` equals the
    /// current recognizer session uid. A fallback equality check against
    /// `connection_id` is permitted but must be logged as a degraded match.
    pub fn admits(&self, audio_session_uid: &str) -> AdmissionResult {
        if self
            .recognizer_session_uid
            .as_deref()
            .is_some_and(|uid| uid == audio_session_uid)
        {
            return AdmissionResult::Admitted;
        }
        if self.connection_id == audio_session_uid {
            return AdmissionResult::DegradedMatch;
        }
        AdmissionResult::Rejected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted,
    DegradedMatch,
    Rejected,
}

impl AdmissionResult {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, AdmissionResult::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_validity_requires_both_fields() {
        let mut audio = sample_audio();
        assert!(audio.is_valid());
        audio.audio_data.clear();
        assert!(!audio.is_valid());
    }

    #[test]
    fn audio_validity_requires_message_id() {
        let mut audio = sample_audio();
        audio.message_id.clear();
        assert!(!audio.is_valid());
    }

    #[test]
    fn session_binding_exact_match_admits() {
        let mut binding = SessionBinding::new("conn-1");
        binding.recognizer_session_uid = Some("S1".to_string());
        assert_eq!(binding.admits("S1"), AdmissionResult::Admitted);
    }

    #[test]
    fn session_binding_connection_id_fallback_is_degraded() {
        let binding = SessionBinding::new("S1");
        assert_eq!(binding.admits("S1"), AdmissionResult::DegradedMatch);
    }

    #[test]
    fn session_binding_mismatch_is_rejected() {
        let mut binding = SessionBinding::new("conn-1");
        binding.recognizer_session_uid = Some("S1".to_string());
        assert_eq!(binding.admits("S2"), AdmissionResult::Rejected);
    }

    #[test]
    fn pattern_kind_round_trips_through_str() {
        for kind in [
            PatternKind::Primary,
            PatternKind::Secondary,
            PatternKind::Conversational,
            PatternKind::Question,
            PatternKind::Punctuation,
            PatternKind::Fuzzy,
        ] {
            let parsed: PatternKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    fn sample_audio() -> Audio {
        Audio {
            audio_data: "YWJj".to_string(),
            audio_metadata: AudioMetadata {
                format: AudioFormat::Wav,
                size_bytes: 3,
                duration_s: 0.1,
                engine: "local_fallback".to_string(),
            },
            session_uid: "S1".to_string(),
            meeting_id: "M1".to_string(),
            original_question: "what time is it?".to_string(),
            response_text: "It is 3:30 PM.".to_string(),
            message_id: "R1".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }
}
