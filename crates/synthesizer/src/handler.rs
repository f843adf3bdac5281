use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;
use chrono::Utc;
use pipeline_domain::codec::Fields;
use pipeline_domain::ports::{TtsGateway, VoiceOptions};
use pipeline_domain::runtime::{StageHandler, StageOutcome};
use pipeline_domain::types::{Audio, AudioMetadata, Reply};
use pipeline_domain::{decode, encode, streams};
use tracing::warn;

use crate::language::detect_language;

/// Synthesized instead of the original reply text when it exceeds
/// `max_text_length`, so one runaway completion cannot blow synthesis time.
const TRUNCATION_WARNING: &str = "My response was too long to read aloud.";

#[derive(Debug, Default)]
pub struct SynthesizerCounters {
    pub replies_processed: AtomicU64,
    pub audio_emitted: AtomicU64,
    pub both_engines_failed: AtomicU64,
    pub truncated: AtomicU64,
    last_success_at: Mutex<Option<String>>,
}

impl SynthesizerCounters {
    pub fn last_success_at(&self) -> Option<String> {
        self.last_success_at.lock().unwrap().clone()
    }

    fn record_success(&self) {
        *self.last_success_at.lock().unwrap() = Some(Utc::now().to_rfc3339());
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "replies_processed": self.replies_processed.load(Ordering::Relaxed),
            "audio_emitted": self.audio_emitted.load(Ordering::Relaxed),
            "both_engines_failed": self.both_engines_failed.load(Ordering::Relaxed),
            "truncated": self.truncated.load(Ordering::Relaxed),
        })
    }
}

/// Implements [`StageHandler`] for stage (C): decodes a `Reply`, detects its
/// language, synthesizes speech via the TTS gateway, and emits an `Audio`
/// record (§4.3).
pub struct SynthesizerHandler {
    tts: Arc<dyn TtsGateway>,
    primary_language: String,
    max_text_length: usize,
    pub counters: Arc<SynthesizerCounters>,
}

impl SynthesizerHandler {
    pub fn new(tts: Arc<dyn TtsGateway>, primary_language: String, max_text_length: usize) -> Self {
        Self { tts, primary_language, max_text_length, counters: Arc::new(SynthesizerCounters::default()) }
    }
}

#[async_trait::async_trait]
impl StageHandler for SynthesizerHandler {
    fn stage_name(&self) -> &'static str {
        "synthesizer"
    }

    async fn process_one(&self, id: &str, fields: &Fields) -> StageOutcome {
        self.counters.replies_processed.fetch_add(1, Ordering::Relaxed);

        let reply: Reply = match decode(fields) {
            Ok(reply) => reply,
            Err(err) => return StageOutcome::DropValidation(format!("{id}: malformed reply: {err}")),
        };

        let (speech_text, truncated) = if reply.response.chars().count() > self.max_text_length {
            warn!(id, len = reply.response.chars().count(), max = self.max_text_length, "reply exceeds max_text_length, synthesizing truncation warning instead");
            self.counters.truncated.fetch_add(1, Ordering::Relaxed);
            (TRUNCATION_WARNING.to_string(), true)
        } else {
            (reply.response.clone(), false)
        };

        let language = detect_language(&speech_text, &self.primary_language);
        let voice_opts = VoiceOptions { voice: None };

        let synthesized = match self.tts.synthesize(&speech_text, &language, &voice_opts).await {
            Ok(synthesized) => synthesized,
            Err(err) => {
                warn!(id, error = %err, "both TTS engines failed, acknowledging reply with no audio");
                self.counters.both_engines_failed.fetch_add(1, Ordering::Relaxed);
                return StageOutcome::Emit(Vec::new());
            }
        };

        let audio = Audio {
            audio_data: base64::engine::general_purpose::STANDARD.encode(&synthesized.bytes),
            audio_metadata: AudioMetadata {
                format: synthesized.format,
                size_bytes: synthesized.bytes.len(),
                duration_s: synthesized.duration_s,
                engine: synthesized.engine.clone(),
            },
            session_uid: reply.session_uid.clone(),
            meeting_id: reply.meeting_id.clone(),
            original_question: reply.original_question.clone(),
            response_text: if truncated { TRUNCATION_WARNING.to_string() } else { reply.response.clone() },
            message_id: reply.message_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
        };

        match encode(
            &audio,
            &[
                ("session_uid", &audio.session_uid),
                ("meeting_id", &audio.meeting_id),
                ("message_id", &audio.message_id),
            ],
        ) {
            Ok(out_fields) => {
                self.counters.audio_emitted.fetch_add(1, Ordering::Relaxed);
                self.counters.record_success();
                StageOutcome::Emit(vec![(streams::TTS_AUDIO_QUEUE.to_string(), out_fields)])
            }
            Err(err) => StageOutcome::DropPermanent(format!("{id}: failed to encode audio: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_domain::codec::encode as encode_entity;
    use pipeline_domain::ports::{EngineStats, SynthesizedAudio, TtsGatewayError};
    use pipeline_domain::types::AudioFormat;
    use std::collections::HashMap;

    struct FakeTts {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl TtsGateway for FakeTts {
        async fn synthesize(&self, text: &str, _language: &str, _voice_opts: &VoiceOptions) -> Result<SynthesizedAudio, TtsGatewayError> {
            if self.fail {
                return Err(TtsGatewayError::ServerError("down".to_string()));
            }
            Ok(SynthesizedAudio { bytes: text.as_bytes().to_vec(), format: AudioFormat::Wav, duration_s: 1.0, engine: "fake".to_string() })
        }

        fn engines(&self) -> Vec<String> {
            vec!["fake".to_string()]
        }

        fn stats(&self) -> HashMap<String, EngineStats> {
            HashMap::new()
        }

        async fn health(&self) -> Result<(), TtsGatewayError> {
            Ok(())
        }
    }

    fn reply_fields(response: &str) -> HashMap<String, String> {
        let reply = Reply {
            response: response.to_string(),
            session_uid: "S1".to_string(),
            meeting_id: "M1".to_string(),
            original_question: "what time is it?".to_string(),
            original_timestamp: "2026-01-01T00:00:00Z".to_string(),
            timestamp: "2026-01-01T00:00:01Z".to_string(),
            message_id: "R1".to_string(),
        };
        encode_entity(&reply, &[("session_uid", &reply.session_uid), ("meeting_id", &reply.meeting_id), ("message_id", &reply.message_id)]).unwrap()
    }

    fn handler(fail: bool) -> SynthesizerHandler {
        SynthesizerHandler::new(Arc::new(FakeTts { fail }), "en".to_string(), 1000)
    }

    #[tokio::test]
    async fn emits_audio_on_successful_synthesis() {
        let handler = handler(false);
        let outcome = handler.process_one("1-0", &reply_fields("It is 3:30 PM.")).await;
        match outcome {
            StageOutcome::Emit(emitted) => {
                assert_eq!(emitted[0].0, streams::TTS_AUDIO_QUEUE);
                let audio: Audio = decode(&emitted[0].1).unwrap();
                assert!(audio.is_valid());
            }
            _ => panic!("expected Emit"),
        }
    }

    #[tokio::test]
    async fn both_engines_failing_acks_with_no_audio() {
        let handler = handler(true);
        let outcome = handler.process_one("1-0", &reply_fields("It is 3:30 PM.")).await;
        match outcome {
            StageOutcome::Emit(emitted) => assert!(emitted.is_empty()),
            _ => panic!("expected Emit([])"),
        }
    }

    #[tokio::test]
    async fn oversized_text_synthesizes_truncation_warning() {
        let handler = handler(false);
        let long_response = "a".repeat(2000);
        let outcome = handler.process_one("1-0", &reply_fields(&long_response)).await;
        match outcome {
            StageOutcome::Emit(emitted) => {
                let audio: Audio = decode(&emitted[0].1).unwrap();
                assert_eq!(audio.response_text, TRUNCATION_WARNING);
            }
            _ => panic!("expected Emit"),
        }
    }

    #[tokio::test]
    async fn malformed_reply_is_dropped_as_validation_failure() {
        let handler = handler(false);
        let mut fields = HashMap::new();
        fields.insert("bogus".to_string(), "x".to_string());
        let outcome = handler.process_one("1-0", &fields).await;
        assert!(matches!(outcome, StageOutcome::DropValidation(_)));
    }
}
