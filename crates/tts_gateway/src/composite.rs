use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::time::Instant;

use pipeline_domain::ports::{EngineStats, SynthesizedAudio, TtsGateway, TtsGatewayError, VoiceOptions};

use crate::local_fallback::LocalFallbackEngine;
use crate::networked::NetworkedTtsEngine;
use crate::{FALLBACK_ENGINE, PRIMARY_ENGINE};

#[derive(Default)]
struct Counters {
    generations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl Counters {
    fn record(&self, elapsed_ms: u64, success: bool) {
        self.generations.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        let generations = self.generations.load(Ordering::Relaxed);
        let total_ms = self.total_duration_ms.load(Ordering::Relaxed);
        EngineStats {
            generations,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            avg_duration_ms: if generations == 0 { 0.0 } else { total_ms as f64 / generations as f64 },
        }
    }
}

/// Implements the engine-selection policy from §4.3: attempt the primary
/// networked engine, fall back to the local engine on failure, and expose
/// per-engine counters for the Synthesizer's `/stats` endpoint.
pub struct CompositeTtsGateway {
    primary: NetworkedTtsEngine,
    fallback: LocalFallbackEngine,
    counters: DashMap<&'static str, Counters>,
}

impl CompositeTtsGateway {
    pub fn new(primary: NetworkedTtsEngine, fallback: LocalFallbackEngine) -> Self {
        let counters = DashMap::new();
        counters.insert(PRIMARY_ENGINE, Counters::default());
        counters.insert(FALLBACK_ENGINE, Counters::default());
        Self { primary, fallback, counters }
    }

    fn record(&self, engine: &'static str, elapsed_ms: u64, success: bool) {
        self.counters.entry(engine).or_default().record(elapsed_ms, success);
    }
}

#[async_trait::async_trait]
impl TtsGateway for CompositeTtsGateway {
    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice_opts: &VoiceOptions,
    ) -> Result<SynthesizedAudio, TtsGatewayError> {
        let start = Instant::now();
        match self.primary.synthesize(text, language, voice_opts).await {
            Ok(audio) => {
                self.record(PRIMARY_ENGINE, start.elapsed().as_millis() as u64, true);
                return Ok(audio);
            }
            Err(err) => {
                self.record(PRIMARY_ENGINE, start.elapsed().as_millis() as u64, false);
                tracing::warn!(error = %err, "primary TTS engine failed, attempting fallback");
            }
        }

        let start = Instant::now();
        match self.fallback.synthesize(text, language) {
            Ok(audio) => {
                self.record(FALLBACK_ENGINE, start.elapsed().as_millis() as u64, true);
                Ok(audio)
            }
            Err(err) => {
                self.record(FALLBACK_ENGINE, start.elapsed().as_millis() as u64, false);
                Err(err)
            }
        }
    }

    fn engines(&self) -> Vec<String> {
        vec![PRIMARY_ENGINE.to_string(), FALLBACK_ENGINE.to_string()]
    }

    fn stats(&self) -> HashMap<String, EngineStats> {
        self.counters
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().snapshot()))
            .collect()
    }

    async fn health(&self) -> Result<(), TtsGatewayError> {
        self.primary.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gateway() -> CompositeTtsGateway {
        // An unreachable base URL forces the primary to fail fast in tests
        // so every call exercises the fallback path deterministically.
        let primary = NetworkedTtsEngine::new("http://127.0.0.1:1", "", Duration::from_millis(200));
        CompositeTtsGateway::new(primary, LocalFallbackEngine::new())
    }

    #[tokio::test]
    async fn falls_back_when_primary_unreachable() {
        let gateway = gateway();
        let result = gateway.synthesize("hello there", "en", &VoiceOptions { voice: None }).await.unwrap();
        assert_eq!(result.engine, FALLBACK_ENGINE, "reported engine must reflect which one actually produced the audio");
        let stats = gateway.stats();
        assert_eq!(stats[PRIMARY_ENGINE].failures, 1);
        assert_eq!(stats[FALLBACK_ENGINE].successes, 1);
    }

    #[tokio::test]
    async fn engines_lists_both_by_name() {
        let gateway = gateway();
        assert_eq!(gateway.engines(), vec![PRIMARY_ENGINE.to_string(), FALLBACK_ENGINE.to_string()]);
    }
}
