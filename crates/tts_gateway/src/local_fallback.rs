use pipeline_domain::ports::{SynthesizedAudio, TtsGatewayError};
use pipeline_domain::types::AudioFormat;

use crate::wav::encode_silence;

/// Deterministic, dependency-free fallback used only when
/// [`crate::NetworkedTtsEngine`] fails. Estimates a speaking duration from
/// text length and encodes that much silence as WAV — enough to keep the
/// pipeline's audio contract satisfiable (Audio record present,
/// `audio_metadata.duration_s` populated) without any external process or
/// OS TTS binary.
pub struct LocalFallbackEngine {
    seconds_per_char: f64,
}

impl LocalFallbackEngine {
    pub fn new() -> Self {
        Self { seconds_per_char: 0.06 }
    }

    pub fn synthesize(&self, text: &str, _language: &str) -> Result<SynthesizedAudio, TtsGatewayError> {
        if text.trim().is_empty() {
            return Err(TtsGatewayError::EmptyAudio);
        }
        let duration_s = (text.chars().count() as f64 * self.seconds_per_char).max(0.3);
        let bytes = encode_silence(duration_s);
        if bytes.len() <= 44 {
            return Err(TtsGatewayError::EmptyAudio);
        }
        Ok(SynthesizedAudio { bytes, format: AudioFormat::Wav, duration_s, engine: crate::FALLBACK_ENGINE.to_string() })
    }
}

impl Default for LocalFallbackEngine {
    fn default() -> Self {
        Self::new()
    }
}
