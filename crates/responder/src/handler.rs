use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use pipeline_domain::codec::Fields;
use pipeline_domain::ports::{GenerateOptions, LlmGateway, LlmGatewayError};
use pipeline_domain::runtime::{retry_with_backoff, StageHandler, StageOutcome};
use pipeline_domain::types::{Command, Reply};
use pipeline_domain::{decode, encode, streams};
use tracing::debug;
use uuid::Uuid;

use crate::history::ConversationHistory;

#[derive(Debug, Default)]
pub struct ResponderCounters {
    pub commands_processed: AtomicU64,
    pub replies_emitted: AtomicU64,
    pub llm_failures: AtomicU64,
    pub fallback_used: AtomicU64,
    last_success_at: Mutex<Option<String>>,
}

impl ResponderCounters {
    pub fn last_success_at(&self) -> Option<String> {
        self.last_success_at.lock().unwrap().clone()
    }

    fn record_success(&self) {
        *self.last_success_at.lock().unwrap() = Some(Utc::now().to_rfc3339());
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "commands_processed": self.commands_processed.load(Ordering::Relaxed),
            "replies_emitted": self.replies_emitted.load(Ordering::Relaxed),
            "llm_failures": self.llm_failures.load(Ordering::Relaxed),
            "fallback_used": self.fallback_used.load(Ordering::Relaxed),
        })
    }
}

/// Implements [`StageHandler`] for stage (B): enriches a `Command` with
/// conversation history, calls the LLM gateway with an in-process retry
/// budget (§4.2, §7), and emits a `Reply`.
pub struct ResponderHandler {
    llm: Arc<dyn LlmGateway>,
    history: Arc<dyn ConversationHistory>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
    persona_preamble: String,
    fallback_response: String,
    pub counters: Arc<ResponderCounters>,
}

impl ResponderHandler {
    pub fn new(
        llm: Arc<dyn LlmGateway>,
        history: Arc<dyn ConversationHistory>,
        model: String,
        temperature: f32,
        max_tokens: u32,
        max_retries: u32,
        persona_preamble: String,
        fallback_response: String,
    ) -> Self {
        Self {
            llm,
            history,
            model,
            temperature,
            max_tokens,
            max_retries,
            persona_preamble,
            fallback_response,
            counters: Arc::new(ResponderCounters::default()),
        }
    }
}

fn build_prompt(persona_preamble: &str, history: &[(String, String)], question: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(persona_preamble);
    prompt.push_str("\n\n");
    for (past_question, past_response) in history {
        prompt.push_str(&format!("User: {past_question}\nRaven: {past_response}\n"));
    }
    prompt.push_str(&format!("User: {question}\nRaven:"));
    prompt
}

#[async_trait::async_trait]
impl StageHandler for ResponderHandler {
    fn stage_name(&self) -> &'static str {
        "responder"
    }

    async fn process_one(&self, id: &str, fields: &Fields) -> StageOutcome {
        self.counters.commands_processed.fetch_add(1, Ordering::Relaxed);

        let command: Command = match decode(fields) {
            Ok(command) => command,
            Err(err) => return StageOutcome::DropValidation(format!("{id}: malformed command: {err}")),
        };

        let history_turns = self.history.turns(&command.session_uid).await;
        let prompt = build_prompt(&self.persona_preamble, &history_turns, &command.question);

        let options = GenerateOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stop: Vec::new(),
        };

        let result = retry_with_backoff(
            "llm_generate",
            self.max_retries,
            LlmGatewayError::is_transient,
            || self.llm.generate(&prompt, &options),
        )
        .await;

        let response_text = match result {
            Ok(text) if text.trim().is_empty() => {
                debug!(id, "LLM returned an empty completion, using configured fallback reply");
                self.counters.fallback_used.fetch_add(1, Ordering::Relaxed);
                self.fallback_response.clone()
            }
            Ok(text) => text,
            Err(err) if err.is_transient() => {
                self.counters.llm_failures.fetch_add(1, Ordering::Relaxed);
                return StageOutcome::Retry(format!("{id}: LLM transient failure after retries: {err}"));
            }
            Err(err) => {
                self.counters.llm_failures.fetch_add(1, Ordering::Relaxed);
                return StageOutcome::DropPermanent(format!("{id}: LLM permanent failure: {err}"));
            }
        };

        self.history.record(&command.session_uid, &command.question, &response_text).await;

        let reply = Reply {
            response: response_text,
            session_uid: command.session_uid.clone(),
            meeting_id: command.meeting_id.clone(),
            original_question: command.question.clone(),
            original_timestamp: command.timestamp.clone(),
            timestamp: Utc::now().to_rfc3339(),
            message_id: Uuid::new_v4().to_string(),
        };

        match encode(
            &reply,
            &[
                ("session_uid", &reply.session_uid),
                ("meeting_id", &reply.meeting_id),
                ("message_id", &reply.message_id),
            ],
        ) {
            Ok(out_fields) => {
                self.counters.replies_emitted.fetch_add(1, Ordering::Relaxed);
                self.counters.record_success();
                StageOutcome::Emit(vec![(streams::LLM_RESPONSES.to_string(), out_fields)])
            }
            Err(err) => StageOutcome::DropPermanent(format!("{id}: failed to encode reply: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use inference_gateway::MockLlmGateway;
    use pipeline_domain::codec::encode as encode_entity;
    use pipeline_domain::types::PatternKind;
    use std::collections::HashMap;

    fn handler_with(llm: MockLlmGateway) -> ResponderHandler {
        ResponderHandler::new(
            Arc::new(llm),
            Arc::new(MemoryHistory::new(10)),
            "test-model".to_string(),
            0.7,
            200,
            2,
            "You are Raven.".to_string(),
            "I don't have an answer for that right now.".to_string(),
        )
    }

    fn command_fields(question: &str, session_uid: &str) -> HashMap<String, String> {
        let command = Command {
            question: question.to_string(),
            session_uid: session_uid.to_string(),
            meeting_id: "M1".to_string(),
            context: "segment 0.0-1.0s".to_string(),
            confidence: 0.95,
            pattern_kind: PatternKind::Primary,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        encode_entity(&command, &[("session_uid", &command.session_uid), ("meeting_id", &command.meeting_id)]).unwrap()
    }

    #[tokio::test]
    async fn emits_reply_on_successful_generation() {
        let handler = handler_with(MockLlmGateway::with_fixed_response("It is 3:30 PM."));
        let fields = command_fields("what time is it?", "S1");
        let outcome = handler.process_one("1-0", &fields).await;
        match outcome {
            StageOutcome::Emit(emitted) => {
                assert_eq!(emitted.len(), 1);
                assert_eq!(emitted[0].0, streams::LLM_RESPONSES);
                let reply: Reply = decode(&emitted[0].1).unwrap();
                assert_eq!(reply.response, "It is 3:30 PM.");
                assert!(!reply.message_id.is_empty());
            }
            _ => panic!("expected Emit"),
        }
    }

    #[tokio::test]
    async fn retries_transient_failure_then_succeeds() {
        let llm = MockLlmGateway::with_fixed_response("ok");
        llm.fail_next_calls(1);
        let handler = handler_with(llm);
        let fields = command_fields("q", "S1");
        let outcome = handler.process_one("1-0", &fields).await;
        assert!(matches!(outcome, StageOutcome::Emit(_)));
    }

    #[tokio::test]
    async fn exhausted_transient_retries_leaves_entry_pending() {
        let llm = MockLlmGateway::with_fixed_response("ok");
        llm.fail_next_calls(10);
        let handler = handler_with(llm);
        let fields = command_fields("q", "S1");
        let outcome = handler.process_one("1-0", &fields).await;
        assert!(matches!(outcome, StageOutcome::Retry(_)));
    }

    #[tokio::test]
    async fn empty_completion_uses_fallback_response() {
        let handler = handler_with(MockLlmGateway::with_fixed_response(""));
        let fields = command_fields("q", "S1");
        let outcome = handler.process_one("1-0", &fields).await;
        match outcome {
            StageOutcome::Emit(emitted) => {
                let reply: Reply = decode(&emitted[0].1).unwrap();
                assert_eq!(reply.response, "I don't have an answer for that right now.");
            }
            _ => panic!("expected Emit"),
        }
    }

    #[tokio::test]
    async fn malformed_command_is_dropped_as_validation_failure() {
        let handler = handler_with(MockLlmGateway::new());
        let mut fields = HashMap::new();
        fields.insert("bogus".to_string(), "x".to_string());
        let outcome = handler.process_one("1-0", &fields).await;
        assert!(matches!(outcome, StageOutcome::DropValidation(_)));
    }

    #[tokio::test]
    async fn history_is_threaded_into_the_next_prompt() {
        let handler = handler_with(MockLlmGateway::with_fixed_response("second answer"));
        let _ = handler.process_one("1-0", &command_fields("first question?", "S1")).await;
        let _ = handler.process_one("1-1", &command_fields("second question?", "S1")).await;
        let recorded = handler.history.turns("S1").await;
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, "first question?");
    }
}
