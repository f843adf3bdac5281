//! The bot/browser boundary (§4.4, §6, Design Notes "cross-language
//! function bridge"): `playAudio`/`setMicrophoneMuted` host→browser,
//! `notifyPlaybackComplete`/`updateRecognizerSessionUid` browser→host,
//! modeled as two `tokio::sync::mpsc` channels carrying the four
//! [`BridgeMessage`] variants instead of the source's registered callback
//! pair per direction.
//!
//! The bot's actual meeting-platform automation (driving a real browser
//! context) is named out of scope in `spec.md` §1 — "the bot's
//! meeting-platform automation (clicking 'join', handling waiting
//! rooms)". `ChannelBrowserBridge` is therefore a logging adapter plus the
//! channel plumbing a real automation binding would attach to: host→browser
//! messages are logged and forwarded to whoever holds `to_browser_receiver`,
//! and — absent a real browser attached to the other end — a self-contained simulator answers
//! `PlayAudio` with a `PlaybackComplete` after an approximation of the
//! clip's duration, so the playback protocol in `player.rs` exercises its
//! full state machine in development and tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use pipeline_domain::{BridgeError, BridgeMessage, BrowserBridge};

pub struct ChannelBrowserBridge {
    to_browser_tx: mpsc::Sender<BridgeMessage>,
    to_browser_rx: Mutex<Option<mpsc::Receiver<BridgeMessage>>>,
    from_browser_tx: mpsc::Sender<BridgeMessage>,
    from_browser_rx: Mutex<mpsc::Receiver<BridgeMessage>>,
    simulate_playback: bool,
}

impl ChannelBrowserBridge {
    /// `simulate_playback` drives the built-in simulator described above.
    /// Set `false` once a real automation binding is forwarding genuine
    /// `PlaybackComplete`/`SessionUidUpdate` notifications into
    /// [`Self::from_browser_sender`].
    pub fn new(simulate_playback: bool) -> Self {
        let (to_browser_tx, to_browser_rx) = mpsc::channel(32);
        let (from_browser_tx, from_browser_rx) = mpsc::channel(32);
        Self {
            to_browser_tx,
            to_browser_rx: Mutex::new(Some(to_browser_rx)),
            from_browser_tx,
            from_browser_rx: Mutex::new(from_browser_rx),
            simulate_playback,
        }
    }

    /// The receiving half a real browser-automation binding would hold to
    /// consume `PlayAudio`/`SetMicMuted` commands issued by the Player.
    /// Returns `None` if already taken — only one binding can attach.
    pub async fn to_browser_receiver(&self) -> Option<mpsc::Receiver<BridgeMessage>> {
        self.to_browser_rx.lock().await.take()
    }

    /// The sending half a real browser-automation binding would hold to
    /// deliver `PlaybackComplete`/`SessionUidUpdate` notifications back
    /// into the host.
    pub fn from_browser_sender(&self) -> mpsc::Sender<BridgeMessage> {
        self.from_browser_tx.clone()
    }

    fn simulated_duration(audio_bytes: &[u8]) -> Duration {
        // No real decoder is attached in simulation mode; approximate
        // playback length from payload size at a nominal bitrate rather
        // than block on an external clock. Clamped so tests run fast.
        let approx_ms = (audio_bytes.len() as u64 / 16).clamp(10, 200);
        Duration::from_millis(approx_ms)
    }
}

#[async_trait]
impl BrowserBridge for ChannelBrowserBridge {
    async fn play_audio(&self, audio_bytes: Vec<u8>, message_id: &str) -> Result<(), BridgeError> {
        info!(message_id, bytes = audio_bytes.len(), "instructing browser to play audio");
        let message_id = message_id.to_string();
        let delay = Self::simulated_duration(&audio_bytes);
        let _ = self
            .to_browser_tx
            .send(BridgeMessage::PlayAudio { audio_bytes, message_id: message_id.clone() })
            .await;

        if self.simulate_playback {
            let completion_tx = self.from_browser_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = completion_tx.send(BridgeMessage::PlaybackComplete { message_id }).await;
            });
        }
        Ok(())
    }

    async fn set_mic_muted(&self, muted: bool) -> Result<(), BridgeError> {
        debug!(muted, "instructing browser to set microphone mute state");
        let _ = self.to_browser_tx.send(BridgeMessage::SetMicMuted(muted)).await;
        Ok(())
    }

    async fn recv(&self) -> Result<BridgeMessage, BridgeError> {
        let mut rx = self.from_browser_rx.lock().await;
        rx.recv().await.ok_or(BridgeError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_playback_reports_completion() {
        let bridge = ChannelBrowserBridge::new(true);
        bridge.play_audio(vec![0u8; 32], "msg-1").await.unwrap();
        let message = bridge.recv().await.unwrap();
        assert_eq!(message, BridgeMessage::PlaybackComplete { message_id: "msg-1".to_string() });
    }

    #[tokio::test]
    async fn session_uid_update_can_be_injected_by_a_real_binding() {
        let bridge = ChannelBrowserBridge::new(false);
        let sender = bridge.from_browser_sender();
        sender.send(BridgeMessage::SessionUidUpdate { session_uid: "S1".to_string() }).await.unwrap();
        let message = bridge.recv().await.unwrap();
        assert_eq!(message, BridgeMessage::SessionUidUpdate { session_uid: "S1".to_string() });
    }

    #[tokio::test]
    async fn simulation_disabled_never_auto_completes() {
        let bridge = ChannelBrowserBridge::new(false);
        bridge.play_audio(vec![0u8; 32], "msg-1").await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(50), bridge.recv()).await;
        assert!(result.is_err(), "no PlaybackComplete should arrive without a real binding or simulation");
    }
}
