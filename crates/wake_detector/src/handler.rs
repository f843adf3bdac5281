use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use pipeline_domain::codec::Fields;
use pipeline_domain::runtime::{StageHandler, StageOutcome};
use pipeline_domain::types::{Command, Segment};
use pipeline_domain::{decode, encode, streams};
use tokio::sync::RwLock;
use tracing::debug;

use crate::matcher::{self, CompiledPatternTable};
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Default)]
pub struct WakeDetectorCounters {
    pub segments_processed: AtomicU64,
    pub commands_emitted: AtomicU64,
    pub rate_limited: AtomicU64,
    last_success_at: Mutex<Option<String>>,
}

impl WakeDetectorCounters {
    pub fn last_success_at(&self) -> Option<String> {
        self.last_success_at.lock().unwrap().clone()
    }

    fn record_success(&self) {
        *self.last_success_at.lock().unwrap() = Some(Utc::now().to_rfc3339());
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "segments_processed": self.segments_processed.load(Ordering::Relaxed),
            "commands_emitted": self.commands_emitted.load(Ordering::Relaxed),
            "rate_limited": self.rate_limited.load(Ordering::Relaxed),
        })
    }
}

/// Implements [`StageHandler`] for stage (A): decodes a `Segment`, runs the
/// matching algorithm from §4.1 against the current pattern table, and
/// emits a `Command` onto `hey_raven_commands` when a wake-word is admitted.
pub struct WakeDetectorHandler {
    patterns: Arc<RwLock<CompiledPatternTable>>,
    rate_limiter: Arc<RateLimiter>,
    pub counters: Arc<WakeDetectorCounters>,
}

impl WakeDetectorHandler {
    pub fn new(patterns: Arc<RwLock<CompiledPatternTable>>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { patterns, rate_limiter, counters: Arc::new(WakeDetectorCounters::default()) }
    }
}

#[async_trait::async_trait]
impl StageHandler for WakeDetectorHandler {
    fn stage_name(&self) -> &'static str {
        "wake_detector"
    }

    async fn process_one(&self, id: &str, fields: &Fields) -> StageOutcome {
        self.counters.segments_processed.fetch_add(1, Ordering::Relaxed);

        let segment: Segment = match decode(fields) {
            Ok(segment) => segment,
            Err(err) => {
                return StageOutcome::DropValidation(format!("{id}: malformed segment: {err}"));
            }
        };

        // §4.1: any internal error here is logged and the segment is
        // skipped — wake-word processing must never block or fail the
        // upstream transcription store.
        let normalized = matcher::normalize(&segment.text);
        if normalized.is_empty() {
            return StageOutcome::Emit(Vec::new());
        }

        let table = self.patterns.read().await;
        let hits = matcher::find_all_hits(&normalized, &table);
        let Some(hit) = matcher::select_best_hit(&hits) else {
            return StageOutcome::Emit(Vec::new());
        };

        let (min_chars, max_chars) = table.question_bounds();
        let question = matcher::extract_question(&normalized, hit);
        if question.len() < min_chars || question.len() > max_chars {
            debug!(id, len = question.len(), min_chars, max_chars, "extracted question outside configured bounds, dropping");
            return StageOutcome::Emit(Vec::new());
        }

        if !self.rate_limiter.admit(&segment.session_uid) {
            debug!(id, session_uid = %segment.session_uid, "wake-word rate-limited");
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            return StageOutcome::Emit(Vec::new());
        }

        let command = Command {
            question,
            session_uid: segment.session_uid.clone(),
            meeting_id: segment.meeting_id.clone(),
            context: format!("segment {:.2}-{:.2}s", segment.segment_start_s, segment.segment_end_s),
            confidence: hit.confidence,
            pattern_kind: hit.kind,
            timestamp: Utc::now().to_rfc3339(),
        };

        match encode(&command, &[("session_uid", &command.session_uid), ("meeting_id", &command.meeting_id)]) {
            Ok(out_fields) => {
                self.counters.commands_emitted.fetch_add(1, Ordering::Relaxed);
                self.counters.record_success();
                StageOutcome::Emit(vec![(streams::HEY_RAVEN_COMMANDS.to_string(), out_fields)])
            }
            Err(err) => StageOutcome::DropPermanent(format!("{id}: failed to encode command: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::PatternTableFile;
    use pipeline_domain::codec::encode as encode_entity;
    use std::collections::HashMap;

    fn handler() -> WakeDetectorHandler {
        let table = CompiledPatternTable::compile(&PatternTableFile::default()).unwrap();
        WakeDetectorHandler::new(
            Arc::new(RwLock::new(table)),
            Arc::new(RateLimiter::new(config::RateLimitConfig::default())),
        )
    }

    fn segment_fields(text: &str, session_uid: &str) -> HashMap<String, String> {
        let segment = Segment {
            text: text.to_string(),
            session_uid: session_uid.to_string(),
            meeting_id: "M1".to_string(),
            segment_start_s: 0.0,
            segment_end_s: 1.0,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        encode_entity(&segment, &[("session_uid", &segment.session_uid), ("meeting_id", &segment.meeting_id)]).unwrap()
    }

    #[tokio::test]
    async fn emits_command_on_wake_word_hit() {
        let handler = handler();
        let fields = segment_fields("hey raven what time is it", "S1");
        let outcome = handler.process_one("1-0", &fields).await;
        match outcome {
            StageOutcome::Emit(emitted) => {
                assert_eq!(emitted.len(), 1);
                assert_eq!(emitted[0].0, streams::HEY_RAVEN_COMMANDS);
            }
            _ => panic!("expected Emit"),
        }
    }

    #[tokio::test]
    async fn no_match_emits_nothing_and_does_not_fail() {
        let handler = handler();
        let fields = segment_fields("just some unrelated chatter", "S1");
        let outcome = handler.process_one("1-0", &fields).await;
        matches!(outcome, StageOutcome::Emit(ref v) if v.is_empty());
    }

    #[tokio::test]
    async fn malformed_segment_is_dropped_as_validation_failure() {
        let handler = handler();
        let mut fields = HashMap::new();
        fields.insert("bogus".to_string(), "x".to_string());
        let outcome = handler.process_one("1-0", &fields).await;
        assert!(matches!(outcome, StageOutcome::DropValidation(_)));
    }

    #[tokio::test]
    async fn second_hit_within_cooldown_is_suppressed() {
        let handler = handler();
        let fields = segment_fields("hey raven what time is it", "S1");
        let _ = handler.process_one("1-0", &fields).await;
        let outcome = handler.process_one("1-1", &fields).await;
        match outcome {
            StageOutcome::Emit(emitted) => assert!(emitted.is_empty()),
            _ => panic!("expected Emit([])"),
        }
    }
}
