//! Stage (D)'s two halves (§4.4): `PlayerIngestHandler` is a
//! [`StageHandler`] that decodes and session-gates incoming `Audio`
//! records off `tts_audio_queue`, enqueuing admitted ones onto the shared
//! [`AudioSessionState`] and acknowledging every entry immediately
//! (admitted, duplicate, or dropped alike) — the Player is the last
//! consumer in the pipeline, so once an entry is queued or diagnosed there
//! is nothing further for redelivery to accomplish. `run_playback_loop`
//! is the actual playback protocol: pop, decode, mute, play, await
//! completion, unmute, repeat — run as its own task so a slow or hung
//! browser-side playback never blocks the broker read loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use pipeline_domain::codec::Fields;
use pipeline_domain::runtime::{StageHandler, StageOutcome};
use pipeline_domain::types::Audio;
use pipeline_domain::{decode, BridgeMessage, BrowserBridge};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::state::{AdmitOutcome, AudioSessionState, PlaybackState};

#[derive(Debug, Default)]
pub struct PlayerCounters {
    pub audios_received: AtomicU64,
    pub playbacks_completed: AtomicU64,
    pub playbacks_timed_out: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub dropped_duplicate: AtomicU64,
    pub dropped_session_mismatch: AtomicU64,
    pub degraded_matches: AtomicU64,
    last_success_at: Mutex<Option<String>>,
}

impl PlayerCounters {
    pub fn last_success_at(&self) -> Option<String> {
        self.last_success_at.lock().unwrap().clone()
    }

    fn record_success(&self) {
        *self.last_success_at.lock().unwrap() = Some(Utc::now().to_rfc3339());
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "audios_received": self.audios_received.load(Ordering::Relaxed),
            "playbacks_completed": self.playbacks_completed.load(Ordering::Relaxed),
            "playbacks_timed_out": self.playbacks_timed_out.load(Ordering::Relaxed),
            "dropped_invalid": self.dropped_invalid.load(Ordering::Relaxed),
            "dropped_duplicate": self.dropped_duplicate.load(Ordering::Relaxed),
            "dropped_session_mismatch": self.dropped_session_mismatch.load(Ordering::Relaxed),
            "degraded_matches": self.degraded_matches.load(Ordering::Relaxed),
        })
    }
}

/// Ingest half of the Player: decodes each `Audio`, admits or drops it per
/// §3's validity rule and §4.4's session gating, and enqueues admitted
/// entries for `run_playback_loop` to actually play.
pub struct PlayerIngestHandler {
    session: Arc<AudioSessionState>,
    pub counters: Arc<PlayerCounters>,
}

impl PlayerIngestHandler {
    pub fn new(session: Arc<AudioSessionState>) -> Self {
        Self { session, counters: Arc::new(PlayerCounters::default()) }
    }
}

#[async_trait::async_trait]
impl StageHandler for PlayerIngestHandler {
    fn stage_name(&self) -> &'static str {
        "bot_player"
    }

    async fn process_one(&self, id: &str, fields: &Fields) -> StageOutcome {
        self.counters.audios_received.fetch_add(1, Ordering::Relaxed);

        let audio: Audio = match decode(fields) {
            Ok(audio) => audio,
            Err(err) => return StageOutcome::DropValidation(format!("{id}: malformed audio record: {err}")),
        };

        match self.session.admit(&audio) {
            AdmitOutcome::Admitted => {
                self.session.enqueue(audio);
                self.counters.record_success();
                StageOutcome::Emit(Vec::new())
            }
            AdmitOutcome::DegradedMatch => {
                self.counters.degraded_matches.fetch_add(1, Ordering::Relaxed);
                warn!(
                    id,
                    session_uid = %audio.session_uid,
                    connection_id = %self.session.binding_snapshot().connection_id,
                    "admitting audio via degraded connection_id fallback match"
                );
                self.session.enqueue(audio);
                self.counters.record_success();
                StageOutcome::Emit(Vec::new())
            }
            AdmitOutcome::RejectedSessionMismatch => {
                self.counters.dropped_session_mismatch.fetch_add(1, Ordering::Relaxed);
                let binding = self.session.binding_snapshot();
                StageOutcome::DropValidation(format!(
                    "{id}: session mismatch, audio.session_uid={} bot.recognizer_session_uid={:?} bot.connection_id={}",
                    audio.session_uid, binding.recognizer_session_uid, binding.connection_id
                ))
            }
            AdmitOutcome::RejectedDuplicate => {
                self.counters.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
                debug!(id, message_id = %audio.message_id, "duplicate message_id within dedup window, dropping (P2)");
                StageOutcome::Emit(Vec::new())
            }
            AdmitOutcome::RejectedInvalid => {
                self.counters.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                StageOutcome::DropValidation(format!("{id}: audio record missing audio_data or message_id"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackConfig {
    pub fallback_cap_s: f64,
    pub grace_s: f64,
}

/// Routes incoming [`BridgeMessage`]s from the browser side: a
/// `SessionUidUpdate` updates the session binding (§3, §4.4); a
/// `PlaybackComplete` fires the matching completion waiter registered by
/// `run_playback_loop`. Runs for the life of the process — independent of
/// both the ingest loop and the playback loop so a stalled one never
/// starves the other two.
pub async fn run_bridge_receive_loop(session: Arc<AudioSessionState>, bridge: Arc<dyn BrowserBridge>) {
    loop {
        match bridge.recv().await {
            Ok(BridgeMessage::SessionUidUpdate { session_uid }) => {
                info!(session_uid = %session_uid, "recognizer session uid updated");
                session.update_recognizer_session_uid(session_uid);
            }
            Ok(BridgeMessage::PlaybackComplete { message_id }) => {
                debug!(message_id = %message_id, "browser reported playback complete");
                session.complete(&message_id);
            }
            Ok(other) => {
                // Host-to-browser variants never arrive on this side; a
                // well-behaved bridge implementation never sends them here.
                debug!(?other, "ignoring unexpected bridge message on the receive side");
            }
            Err(err) => {
                error!(error = %err, "bridge receive channel closed, bridge receive loop exiting");
                return;
            }
        }
    }
}

/// Runs the playback protocol (§4.4 steps 1-7) until `shutdown` fires, at
/// which point the loop finishes whatever is currently playing (bounded by
/// its own timeout) and then exits into `Draining` — new audio already
/// stopped arriving because the ingest stage task observes the same
/// shutdown signal.
pub async fn run_playback_loop(
    session: Arc<AudioSessionState>,
    bridge: Arc<dyn BrowserBridge>,
    config: PlaybackConfig,
    counters: Arc<PlayerCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let audio = match wait_for_next(&session, &mut shutdown).await {
            Some(audio) => audio,
            None => break,
        };

        session.set_state(PlaybackState::Playing);
        play_one(&session, &bridge, &audio, &config, &counters).await;

        if session.queue_len() == 0 {
            session.set_state(PlaybackState::Idle);
        }

        if *shutdown.borrow() {
            break;
        }
    }
    session.set_state(PlaybackState::Draining);
    info!("playback loop drained and exiting");
}

/// Blocks until an item is available or shutdown is signaled while idle.
/// Once shutdown is signaled, any audio already queued but not yet started
/// is abandoned — only a playback already in progress when the signal
/// arrives is allowed to finish (spec.md §4.4's `Draining` transition).
async fn wait_for_next(session: &Arc<AudioSessionState>, shutdown: &mut watch::Receiver<bool>) -> Option<Audio> {
    loop {
        if let Some(audio) = session.try_pop() {
            return Some(audio);
        }
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            _ = session.notified() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return session.try_pop();
        }
    }
}

async fn play_one(
    session: &Arc<AudioSessionState>,
    bridge: &Arc<dyn BrowserBridge>,
    audio: &Audio,
    config: &PlaybackConfig,
    counters: &Arc<PlayerCounters>,
) {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(&audio.audio_data) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(message_id = %audio.message_id, error = %err, "failed to decode base64 audio payload, skipping");
            return;
        }
    };

    if let Err(err) = bridge.set_mic_muted(true).await {
        warn!(message_id = %audio.message_id, error = %err, "failed to mute microphone, playing anyway");
    }

    let completion = session.register_completion(&audio.message_id);
    let outcome = match bridge.play_audio(bytes, &audio.message_id).await {
        Ok(()) => {
            let timeout = Duration::from_secs_f64(
                audio.audio_metadata.duration_s.max(config.fallback_cap_s) + config.grace_s,
            );
            tokio::time::timeout(timeout, completion).await
        }
        Err(err) => {
            warn!(message_id = %audio.message_id, error = %err, "browser failed to start playback");
            Ok(Ok(()))
        }
    };

    match outcome {
        Ok(Ok(())) => {
            counters.playbacks_completed.fetch_add(1, Ordering::Relaxed);
            counters.record_success();
        }
        Ok(Err(_)) => {
            // completion sender dropped without firing; treat as done.
            counters.playbacks_completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            counters.playbacks_timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(message_id = %audio.message_id, "playback did not complete before its timeout, unmuting and moving on");
        }
    }

    if let Err(err) = bridge.set_mic_muted(false).await {
        warn!(message_id = %audio.message_id, error = %err, "failed to unmute microphone after playback");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_domain::codec::encode as encode_entity;
    use pipeline_domain::types::{AudioFormat, AudioMetadata};
    use pipeline_domain::BridgeError;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Mutex as TokioMutex;

    fn audio_fields(session_uid: &str, message_id: &str) -> HashMap<String, String> {
        let audio = Audio {
            audio_data: base64::engine::general_purpose::STANDARD.encode(b"abc"),
            audio_metadata: AudioMetadata { format: AudioFormat::Wav, size_bytes: 3, duration_s: 0.01, engine: "local_fallback".to_string() },
            session_uid: session_uid.to_string(),
            meeting_id: "M1".to_string(),
            original_question: "what time is it?".to_string(),
            response_text: "It is 3:30 PM.".to_string(),
            message_id: message_id.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        encode_entity(
            &audio,
            &[("session_uid", &audio.session_uid), ("meeting_id", &audio.meeting_id), ("message_id", &audio.message_id)],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn admitted_audio_is_enqueued_and_acked() {
        let session = Arc::new(AudioSessionState::new("conn-1", 16));
        session.update_recognizer_session_uid("S1".to_string());
        let handler = PlayerIngestHandler::new(session.clone());

        let outcome = handler.process_one("1-0", &audio_fields("S1", "m1")).await;
        assert!(matches!(outcome, StageOutcome::Emit(ref v) if v.is_empty()));
        assert_eq!(session.queue_len(), 1);
    }

    #[tokio::test]
    async fn session_mismatch_is_dropped_without_touching_queue() {
        let session = Arc::new(AudioSessionState::new("conn-1", 16));
        session.update_recognizer_session_uid("S1".to_string());
        let handler = PlayerIngestHandler::new(session.clone());

        let outcome = handler.process_one("1-0", &audio_fields("S2", "m1")).await;
        assert!(matches!(outcome, StageOutcome::DropValidation(_)));
        assert_eq!(session.queue_len(), 0);
    }

    struct RecordingBridge {
        mute_calls: TokioMutex<Vec<bool>>,
        fail_playback: AtomicBool,
        session: Arc<AudioSessionState>,
    }

    #[async_trait::async_trait]
    impl BrowserBridge for RecordingBridge {
        async fn play_audio(&self, _audio_bytes: Vec<u8>, message_id: &str) -> Result<(), BridgeError> {
            if self.fail_playback.load(Ordering::Relaxed) {
                return Err(BridgeError::PlaybackFailed("simulated failure".to_string()));
            }
            self.session.complete(message_id);
            Ok(())
        }

        async fn set_mic_muted(&self, muted: bool) -> Result<(), BridgeError> {
            self.mute_calls.lock().await.push(muted);
            Ok(())
        }

        async fn recv(&self) -> Result<BridgeMessage, BridgeError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn playback_mutes_then_unmutes_around_a_completed_clip() {
        let session = Arc::new(AudioSessionState::new("conn-1", 16));
        session.update_recognizer_session_uid("S1".to_string());
        let bridge = Arc::new(RecordingBridge {
            mute_calls: TokioMutex::new(Vec::new()),
            fail_playback: AtomicBool::new(false),
            session: session.clone(),
        });
        session.enqueue(
            decode::<Audio>(&audio_fields("S1", "m1")).unwrap(),
        );

        let (tx, rx) = watch::channel(false);
        let counters = Arc::new(PlayerCounters::default());
        let config = PlaybackConfig { fallback_cap_s: 1.0, grace_s: 0.1 };

        // Drain exactly one item then stop: flip shutdown right after.
        let session_for_task = session.clone();
        let bridge_for_task = bridge.clone() as Arc<dyn BrowserBridge>;
        let handle = tokio::spawn(run_playback_loop(session_for_task, bridge_for_task, config, counters.clone(), rx.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

        assert_eq!(counters.playbacks_completed.load(Ordering::Relaxed), 1);
        let calls = bridge.mute_calls.lock().await;
        assert_eq!(*calls, vec![true, false]);
    }

    #[tokio::test]
    async fn playback_failure_still_unmutes_and_moves_on() {
        let session = Arc::new(AudioSessionState::new("conn-1", 16));
        session.update_recognizer_session_uid("S1".to_string());
        let bridge = Arc::new(RecordingBridge {
            mute_calls: TokioMutex::new(Vec::new()),
            fail_playback: AtomicBool::new(true),
            session: session.clone(),
        });
        session.enqueue(decode::<Audio>(&audio_fields("S1", "m1")).unwrap());

        let config = PlaybackConfig { fallback_cap_s: 0.05, grace_s: 0.01 };
        let counters = Arc::new(PlayerCounters::default());
        play_one(&session, &(bridge.clone() as Arc<dyn BrowserBridge>), &decode::<Audio>(&audio_fields("S1", "m1")).unwrap(), &config, &counters).await;

        let calls = bridge.mute_calls.lock().await;
        assert_eq!(*calls, vec![true, false]);
    }
}
