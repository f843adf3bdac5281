//! [`pipeline_domain::TtsGateway`] implementations used by the Synthesizer
//! (§4.3, §6): `NetworkedTtsEngine` (a primary HTTP-backed engine, client
//! construction mirroring the teacher's `OpenAiCompatibleBackend`) and
//! `LocalFallbackEngine` (a deterministic in-process WAV encoder used only
//! when the networked engine fails, so the crate never shells out to an OS
//! TTS binary). `CompositeTtsGateway` wires the two together with the
//! primary/fallback selection policy and the per-engine counters the
//! Synthesizer's `/stats` endpoint reports.

mod composite;
mod local_fallback;
mod networked;
mod wav;

pub use composite::CompositeTtsGateway;
pub use local_fallback::LocalFallbackEngine;
pub use networked::NetworkedTtsEngine;

/// Engine name recorded onto `audio_metadata.engine` (§3) when
/// [`NetworkedTtsEngine`] produces the audio.
pub const PRIMARY_ENGINE: &str = "networked_primary";
/// Engine name recorded onto `audio_metadata.engine` (§3) when
/// [`LocalFallbackEngine`] produces the audio.
pub const FALLBACK_ENGINE: &str = "local_fallback";
