use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use pipeline_domain::ports::{SynthesizedAudio, TtsGatewayError, VoiceOptions};
use pipeline_domain::types::AudioFormat;

/// HTTP client for the primary networked TTS provider. Client construction
/// mirrors the teacher's `OpenAiCompatibleBackend` (bounded timeouts, one
/// shared `reqwest::Client`).
pub struct NetworkedTtsEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl NetworkedTtsEngine {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build reqwest client");
        Self { client, base_url: base_url.into(), api_key: api_key.into(), timeout }
    }

    pub async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice_opts: &VoiceOptions,
    ) -> Result<SynthesizedAudio, TtsGatewayError> {
        let url = format!("{}/synthesize", self.base_url.trim_end_matches('/'));
        let request = SynthesizeRequest { text, language, voice: voice_opts.voice.as_deref() };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status_error(status, &body));
        }

        let parsed: SynthesizeResponse = response
            .json()
            .await
            .map_err(|err| TtsGatewayError::ServerError(format!("malformed synthesis response: {err}")))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(parsed.audio_base64)
            .map_err(|err| TtsGatewayError::ServerError(format!("invalid base64 audio: {err}")))?;
        if bytes.is_empty() {
            return Err(TtsGatewayError::EmptyAudio);
        }

        let format = match parsed.format.as_str() {
            "mp3" => AudioFormat::Mp3,
            _ => AudioFormat::Wav,
        };

        Ok(SynthesizedAudio { bytes, format, duration_s: parsed.duration_s, engine: crate::PRIMARY_ENGINE.to_string() })
    }

    pub async fn health(&self) -> Result<(), TtsGatewayError> {
        let url = format!("{}/health", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TtsGatewayError::ServerError(format!("health check returned {}", response.status())))
        }
    }
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SynthesizeResponse {
    audio_base64: String,
    format: String,
    duration_s: f64,
}

fn classify_transport_error(err: reqwest::Error) -> TtsGatewayError {
    if err.is_timeout() {
        TtsGatewayError::Timeout
    } else {
        TtsGatewayError::Network(err.to_string())
    }
}

fn classify_status_error(status: reqwest::StatusCode, body: &str) -> TtsGatewayError {
    if status.is_server_error() {
        TtsGatewayError::ServerError(format!("{status}: {body}"))
    } else {
        TtsGatewayError::ClientError(format!("{status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_server_error_as_transient() {
        let err = classify_status_error(reqwest::StatusCode::BAD_GATEWAY, "down");
        assert!(err.is_transient());
    }

    #[test]
    fn classifies_client_error_as_permanent() {
        let err = classify_status_error(reqwest::StatusCode::UNPROCESSABLE_ENTITY, "bad text");
        assert!(!err.is_transient());
    }
}
