//! Minimal PCM16 WAV encoding, shared by [`crate::LocalFallbackEngine`].

const SAMPLE_RATE: u32 = 16_000;

/// Encodes `duration_s` of silence as a mono 16-bit PCM WAV file. Silence
/// (rather than a synthesized waveform) is the point: this engine exists to
/// keep the pipeline's audio contract satisfiable when the networked engine
/// is unreachable, not to produce intelligible speech.
pub fn encode_silence(duration_s: f64) -> Vec<u8> {
    let num_samples = ((duration_s.max(0.0)) * SAMPLE_RATE as f64) as u32;
    let data_len = num_samples * 2; // 16-bit mono
    let riff_len = 36 + data_len;

    let mut buf = Vec::with_capacity(44 + data_len as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&riff_len.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    let byte_rate = SAMPLE_RATE * 2;
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.resize(buf.len() + data_len as usize, 0);

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_valid_riff_header() {
        let wav = encode_silence(0.5);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        let expected_samples = (0.5 * SAMPLE_RATE as f64) as u32;
        assert_eq!(wav.len(), 44 + (expected_samples * 2) as usize);
    }

    #[test]
    fn zero_duration_is_header_only() {
        let wav = encode_silence(0.0);
        assert_eq!(wav.len(), 44);
    }
}
