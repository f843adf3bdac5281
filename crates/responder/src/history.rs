//! Per-session conversation history (§4.2, §5): a bounded ring buffer of
//! the last `history_turns` `(question, response)` pairs, used to enrich
//! the prompt sent to the LLM gateway. Two backends implement the same
//! [`ConversationHistory`] port: [`MemoryHistory`] (the default — private
//! to one process, lost on restart) and [`BrokerHistory`] (the opt-in
//! `responder.history_backend = "broker"` mode from SPEC_FULL.md §3,
//! persisting turns onto a `conversation_history::<session_uid>` auxiliary
//! stream via the same [`Broker`] port every stage already depends on,
//! rather than introducing a second storage primitive).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use pipeline_domain::{Broker, Fields};

#[async_trait]
pub trait ConversationHistory: Send + Sync {
    async fn turns(&self, session_uid: &str) -> Vec<(String, String)>;

    async fn record(&self, session_uid: &str, question: &str, response: &str);
}

/// In-memory ring buffer, sharded by `session_uid` via `DashMap` (grounded
/// on the same sharded-state pattern the WakeDetector's rate limiter uses).
pub struct MemoryHistory {
    max_turns: usize,
    sessions: DashMap<String, VecDeque<(String, String)>>,
}

impl MemoryHistory {
    pub fn new(max_turns: usize) -> Self {
        Self { max_turns: max_turns.max(1), sessions: DashMap::new() }
    }
}

#[async_trait]
impl ConversationHistory for MemoryHistory {
    async fn turns(&self, session_uid: &str) -> Vec<(String, String)> {
        self.sessions.get(session_uid).map(|q| q.iter().cloned().collect()).unwrap_or_default()
    }

    async fn record(&self, session_uid: &str, question: &str, response: &str) {
        let mut entry = self.sessions.entry(session_uid.to_string()).or_default();
        entry.push_back((question.to_string(), response.to_string()));
        while entry.len() > self.max_turns {
            entry.pop_front();
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryTurn {
    question: String,
    response: String,
}

/// Broker-backed history: an in-memory cache fronting a durable auxiliary
/// stream per session, so a restarted Responder can rehydrate instead of
/// starting every session with empty context.
pub struct BrokerHistory {
    broker: Arc<dyn Broker>,
    cache: MemoryHistory,
}

impl BrokerHistory {
    pub fn new(broker: Arc<dyn Broker>, max_turns: usize) -> Self {
        Self { broker, cache: MemoryHistory::new(max_turns) }
    }

    fn stream_name(session_uid: &str) -> String {
        format!("conversation_history::{session_uid}")
    }

    /// Reads every turn ever appended for `session_uid` and folds it into
    /// the in-memory cache (bounded to `max_turns` by `MemoryHistory`
    /// itself). Uses a dedicated consumer group so rehydration never
    /// competes with a real consumer group's delivery accounting.
    async fn rehydrate(&self, session_uid: &str) {
        let stream = Self::stream_name(session_uid);
        const GROUP: &str = "history_rehydrate";
        if self.broker.ensure_group(&stream, GROUP).await.is_err() {
            return;
        }
        let entries = match self.broker.read_group(&stream, GROUP, "responder-rehydrate", 1000, 0).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(session_uid, error = %err, "failed to rehydrate conversation history from broker");
                return;
            }
        };
        for (id, fields) in entries {
            if let Some(payload) = fields.get("payload") {
                if let Ok(turn) = serde_json::from_str::<HistoryTurn>(payload) {
                    self.cache.record(session_uid, &turn.question, &turn.response).await;
                }
            }
            let _ = self.broker.ack(&stream, GROUP, &id).await;
        }
    }
}

#[async_trait]
impl ConversationHistory for BrokerHistory {
    async fn turns(&self, session_uid: &str) -> Vec<(String, String)> {
        if self.cache.turns(session_uid).await.is_empty() {
            self.rehydrate(session_uid).await;
        }
        self.cache.turns(session_uid).await
    }

    async fn record(&self, session_uid: &str, question: &str, response: &str) {
        self.cache.record(session_uid, question, response).await;

        let turn = HistoryTurn { question: question.to_string(), response: response.to_string() };
        let Ok(payload) = serde_json::to_string(&turn) else { return };
        let mut fields = Fields::new();
        fields.insert("payload".to_string(), payload);
        let stream = Self::stream_name(session_uid);
        if let Err(err) = self.broker.append(&stream, fields).await {
            tracing::warn!(session_uid, error = %err, "failed to persist conversation turn to broker-backed history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::MemoryBroker;

    #[tokio::test]
    async fn memory_history_bounds_to_max_turns() {
        let history = MemoryHistory::new(2);
        history.record("s1", "q1", "a1").await;
        history.record("s1", "q2", "a2").await;
        history.record("s1", "q3", "a3").await;
        let turns = history.turns("s1").await;
        assert_eq!(turns, vec![("q2".to_string(), "a2".to_string()), ("q3".to_string(), "a3".to_string())]);
    }

    #[tokio::test]
    async fn memory_history_is_sharded_per_session() {
        let history = MemoryHistory::new(5);
        history.record("s1", "q1", "a1").await;
        assert!(history.turns("s2").await.is_empty());
    }

    #[tokio::test]
    async fn broker_history_survives_rehydration() {
        let broker = Arc::new(MemoryBroker::new());
        let history = BrokerHistory::new(broker.clone(), 5);
        history.record("s1", "what time is it?", "3:30 PM").await;

        // A freshly constructed history (simulating a Responder restart)
        // rehydrates from the same broker-backed stream.
        let restarted = BrokerHistory::new(broker, 5);
        let turns = restarted.turns("s1").await;
        assert_eq!(turns, vec![("what time is it?".to_string(), "3:30 PM".to_string())]);
    }
}
