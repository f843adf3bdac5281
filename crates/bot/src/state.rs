//! `AudioSessionState` (§4.4, §5, Design Notes "arena ownership"): the one
//! piece of mutable state a bot process holds — single-threaded by
//! construction (one bot per meeting, one `AudioSessionState` per bot). It
//! owns the FIFO playback queue, the `Idle`/`Playing`/`Draining` state
//! machine, the current `SessionBinding`, and the `message_id` dedup
//! window (P2). The queue owns its `Audio` entries outright; nothing holds
//! a reference back to the bot, matching the arena shape the design notes
//! call for — ids (`message_id`, `session_uid`) substitute for pointers.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use lru::LruCache;
use pipeline_domain::{AdmissionResult, Audio, SessionBinding};
use tokio::sync::{oneshot, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    DegradedMatch,
    RejectedSessionMismatch,
    RejectedDuplicate,
    RejectedInvalid,
}

pub struct AudioSessionState {
    binding: StdMutex<SessionBinding>,
    queue: StdMutex<VecDeque<Audio>>,
    state: StdMutex<PlaybackState>,
    dedup: StdMutex<LruCache<String, ()>>,
    /// Completion waiters keyed by `message_id`, registered just before
    /// `play_audio` is called and fired by the bridge-receive loop when the
    /// matching `PlaybackComplete` arrives.
    pending_completions: DashMap<String, oneshot::Sender<()>>,
    notify: Notify,
}

impl AudioSessionState {
    pub fn new(connection_id: impl Into<String>, dedup_window: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(dedup_window.max(1)).unwrap();
        Self {
            binding: StdMutex::new(SessionBinding::new(connection_id)),
            queue: StdMutex::new(VecDeque::new()),
            state: StdMutex::new(PlaybackState::Idle),
            dedup: StdMutex::new(LruCache::new(capacity)),
            pending_completions: DashMap::new(),
            notify: Notify::new(),
        }
    }

    /// Learned at runtime when the bot's recognizer WebSocket opens (§3,
    /// §4.4), delivered here via a `SessionUidUpdate` bridge message.
    pub fn update_recognizer_session_uid(&self, session_uid: String) {
        self.binding.lock().unwrap().recognizer_session_uid = Some(session_uid);
    }

    pub fn binding_snapshot(&self) -> SessionBinding {
        self.binding.lock().unwrap().clone()
    }

    /// Validates and session-gates an incoming Audio, and — only once
    /// fully admitted — records it in the dedup window. Dropping a
    /// duplicate or invalid record must not consume a dedup slot.
    pub fn admit(&self, audio: &Audio) -> AdmitOutcome {
        if !audio.is_valid() {
            return AdmitOutcome::RejectedInvalid;
        }

        let admission = self.binding.lock().unwrap().admits(&audio.session_uid);
        if !admission.is_admitted() {
            return AdmitOutcome::RejectedSessionMismatch;
        }

        let mut dedup = self.dedup.lock().unwrap();
        if dedup.contains(&audio.message_id) {
            return AdmitOutcome::RejectedDuplicate;
        }
        dedup.put(audio.message_id.clone(), ());

        match admission {
            AdmissionResult::Admitted => AdmitOutcome::Admitted,
            AdmissionResult::DegradedMatch => AdmitOutcome::DegradedMatch,
            AdmissionResult::Rejected => unreachable!("checked above"),
        }
    }

    pub fn enqueue(&self, audio: Audio) {
        self.queue.lock().unwrap().push_back(audio);
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Audio> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: PlaybackState) {
        *self.state.lock().unwrap() = state;
    }

    /// Registers a completion waiter for `message_id`, to be fired by
    /// [`Self::complete`] once the browser reports `PlaybackComplete`.
    pub fn register_completion(&self, message_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_completions.insert(message_id.to_string(), tx);
        rx
    }

    pub fn complete(&self, message_id: &str) {
        if let Some((_, tx)) = self.pending_completions.remove(message_id) {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_domain::{AudioFormat, AudioMetadata};

    fn audio(session_uid: &str, message_id: &str) -> Audio {
        Audio {
            audio_data: "YWJj".to_string(),
            audio_metadata: AudioMetadata { format: AudioFormat::Wav, size_bytes: 3, duration_s: 0.1, engine: "local_fallback".to_string() },
            session_uid: session_uid.to_string(),
            meeting_id: "M1".to_string(),
            original_question: "what time is it?".to_string(),
            response_text: "It is 3:30 PM.".to_string(),
            message_id: message_id.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn rejects_session_mismatch() {
        let state = AudioSessionState::new("conn-1", 16);
        state.update_recognizer_session_uid("S1".to_string());
        assert_eq!(state.admit(&audio("S2", "m1")), AdmitOutcome::RejectedSessionMismatch);
    }

    #[test]
    fn admits_matching_session() {
        let state = AudioSessionState::new("conn-1", 16);
        state.update_recognizer_session_uid("S1".to_string());
        assert_eq!(state.admit(&audio("S1", "m1")), AdmitOutcome::Admitted);
    }

    #[test]
    fn degraded_match_falls_back_to_connection_id() {
        // Before the recognizer session uid is ever learned, the only
        // equality check available is against connection_id (logged as
        // degraded in player.rs).
        let state = AudioSessionState::new("conn-1", 16);
        assert_eq!(state.admit(&audio("conn-1", "m1")), AdmitOutcome::DegradedMatch);
    }

    #[test]
    fn duplicate_message_id_is_rejected_within_window() {
        let state = AudioSessionState::new("conn-1", 16);
        state.update_recognizer_session_uid("S1".to_string());
        assert_eq!(state.admit(&audio("S1", "m1")), AdmitOutcome::Admitted);
        assert_eq!(state.admit(&audio("S1", "m1")), AdmitOutcome::RejectedDuplicate);
    }

    #[test]
    fn invalid_audio_is_rejected_before_dedup_consumes_a_slot() {
        let state = AudioSessionState::new("conn-1", 16);
        state.update_recognizer_session_uid("S1".to_string());
        let mut invalid = audio("S1", "");
        invalid.message_id.clear();
        assert_eq!(state.admit(&invalid), AdmitOutcome::RejectedInvalid);
        // the same message_id, once valid, is still admissible afterwards
        assert_eq!(state.admit(&audio("S1", "m1")), AdmitOutcome::Admitted);
    }

    #[test]
    fn queue_is_strict_fifo() {
        let state = AudioSessionState::new("conn-1", 16);
        state.enqueue(audio("S1", "m1"));
        state.enqueue(audio("S1", "m2"));
        assert_eq!(state.try_pop().unwrap().message_id, "m1");
        assert_eq!(state.try_pop().unwrap().message_id, "m2");
        assert!(state.try_pop().is_none());
    }

    #[tokio::test]
    async fn completion_waiter_fires_on_matching_message_id() {
        let state = AudioSessionState::new("conn-1", 16);
        let rx = state.register_completion("m1");
        state.complete("m1");
        assert!(rx.await.is_ok());
    }
}
