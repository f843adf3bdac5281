//! Port traits implemented by `broker`, `inference_gateway`, `tts_gateway`
//! and `bot`. Stages depend on these traits, never on a concrete adapter —
//! the same pattern the teacher workspace follows in `services::*::ports`.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::codec::Fields;

// ==================== Broker ====================

pub type StreamId = String;

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: StreamId,
    pub consumer: String,
    pub idle_ms: u64,
    pub deliveries: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub length: u64,
    pub first_id: Option<StreamId>,
    pub last_id: Option<StreamId>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    ConnectionFailed(String),
    #[error("broker command failed: {0}")]
    CommandFailed(String),
    #[error("stream or group does not exist: {0}")]
    NotFound(String),
}

impl BrokerError {
    /// Whether the stage loop should retry (leave the entry pending) rather
    /// than treat this as a poison failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::ConnectionFailed(_) | BrokerError::CommandFailed(_))
    }
}

/// A durable append-only stream log with per-stream consumer groups.
/// Implemented over Redis Streams by `broker::RedisBroker`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    async fn append(&self, stream: &str, fields: Fields) -> Result<StreamId, BrokerError>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(StreamId, Fields)>, BrokerError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError>;

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
    ) -> Result<Vec<(StreamId, Fields)>, BrokerError>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError>;

    async fn group_info(&self, stream: &str, group: &str) -> Result<GroupInfo, BrokerError>;
}

// ==================== LLM gateway ====================

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LlmGatewayError {
    #[error("request to LLM provider timed out")]
    Timeout,
    #[error("LLM provider returned a server error: {0}")]
    ServerError(String),
    #[error("network error reaching LLM provider: {0}")]
    Network(String),
    #[error("requested model not found: {0}")]
    ModelNotFound(String),
    #[error("LLM provider rejected the request: {0}")]
    ClientError(String),
}

impl LlmGatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmGatewayError::Timeout | LlmGatewayError::ServerError(_) | LlmGatewayError::Network(_)
        )
    }
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, LlmGatewayError>;

    async fn health(&self) -> Result<(), LlmGatewayError>;

    async fn list_models(&self) -> Result<Vec<String>, LlmGatewayError>;
}

// ==================== TTS gateway ====================

#[derive(Debug, Clone)]
pub struct VoiceOptions {
    pub voice: Option<String>,
}

#[derive(Debug, Error)]
pub enum TtsGatewayError {
    #[error("request to TTS provider timed out")]
    Timeout,
    #[error("TTS provider returned a server error: {0}")]
    ServerError(String),
    #[error("network error reaching TTS provider: {0}")]
    Network(String),
    #[error("TTS provider rejected the request: {0}")]
    ClientError(String),
    #[error("TTS provider returned empty audio")]
    EmptyAudio,
}

impl TtsGatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TtsGatewayError::Timeout | TtsGatewayError::ServerError(_) | TtsGatewayError::Network(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: crate::types::AudioFormat,
    pub duration_s: f64,
    /// Name of the engine that actually produced `bytes` — primary or
    /// fallback — so §4.3's `audio_metadata.engine` reflects reality even
    /// when the primary failed over.
    pub engine: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub generations: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
}

#[async_trait]
pub trait TtsGateway: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice_opts: &VoiceOptions,
    ) -> Result<SynthesizedAudio, TtsGatewayError>;

    fn engines(&self) -> Vec<String>;

    fn stats(&self) -> std::collections::HashMap<String, EngineStats>;

    async fn health(&self) -> Result<(), TtsGatewayError>;
}

// ==================== Bot <-> browser bridge ====================

/// The four message kinds exchanged across the bot/browser boundary, per
/// the design notes' narrow-message-channel model. Host-to-browser:
/// `PlayAudio`, `SetMicMuted`. Browser-to-host: `PlaybackComplete`,
/// `SessionUidUpdate`.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeMessage {
    PlayAudio { audio_bytes: Vec<u8>, message_id: String },
    SetMicMuted(bool),
    PlaybackComplete { message_id: String },
    SessionUidUpdate { session_uid: String },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("browser bridge channel closed")]
    ChannelClosed,
    #[error("browser reported a playback failure: {0}")]
    PlaybackFailed(String),
}

/// The host-side half of the bot/browser boundary. A real implementation
/// binds these calls to whichever browser-automation library drives the
/// meeting client; that binding is out of scope here (see `bot::bridge` for
/// the channel-backed stand-in used in this crate).
#[async_trait]
pub trait BrowserBridge: Send + Sync {
    async fn play_audio(&self, audio_bytes: Vec<u8>, message_id: &str) -> Result<(), BridgeError>;

    async fn set_mic_muted(&self, muted: bool) -> Result<(), BridgeError>;

    /// Awaits the next `PlaybackComplete` or `SessionUidUpdate` notification
    /// from the browser side.
    async fn recv(&self) -> Result<BridgeMessage, BridgeError>;
}
