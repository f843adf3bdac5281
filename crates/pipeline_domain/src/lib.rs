//! Shared domain types, wire codec, port traits and stage-loop scaffolding
//! for the Hey Raven pipeline. Every stage crate (`wake_detector`,
//! `responder`, `synthesizer`, `bot`) depends on this crate and never
//! redefines a `Segment`/`Command`/`Reply`/`Audio`, the broker record
//! codec, or the standard consumer loop — that would fork the one place
//! the pipeline's correlation invariants (§3) are enforced.

pub mod codec;
pub mod health;
pub mod ports;
pub mod runtime;
pub mod shutdown;
pub mod types;

pub use codec::{decode, encode, CodecError, Fields, FromFlatFields};
pub use health::{HealthProvider, HealthResponse};
pub use ports::{
    Broker, BrokerError, BridgeError, BridgeMessage, BrowserBridge, EngineStats, GenerateOptions,
    GroupInfo, LlmGateway, LlmGatewayError, PendingEntry, StreamId, StreamInfo, SynthesizedAudio,
    TtsGateway, TtsGatewayError, VoiceOptions,
};
pub use runtime::{run_stage, StageHandler, StageOutcome, StageRuntimeConfig};
pub use shutdown::{install_signal_handler, ShutdownCoordinator, ShutdownStage, ShutdownStageResult};
pub use types::{
    AdmissionResult, Audio, AudioFormat, AudioMetadata, Command, PatternKind, Reply, Segment,
    SessionBinding,
};

/// Stream names, fixed across the whole pipeline (§6). Stage crates refer to
/// these instead of hand-copying string literals so a rename touches one
/// place.
pub mod streams {
    pub const TRANSCRIPTS: &str = "transcripts";
    pub const HEY_RAVEN_COMMANDS: &str = "hey_raven_commands";
    pub const LLM_RESPONSES: &str = "llm_responses";
    pub const TTS_AUDIO_QUEUE: &str = "tts_audio_queue";

    /// Dead-letter stream name for a given input stream, per the
    /// `<stream>.dlq` convention decided in SPEC_FULL.md §3.
    pub fn dlq_of(stream: &str) -> String {
        format!("{stream}.dlq")
    }
}
