use serde::{Deserialize, Serialize};

/// Shared by every stage binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Connection and recovery knobs for the broker client, shared by every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    pub stale_idle_ms: u64,
    pub read_batch: usize,
    pub block_ms: u64,
    pub max_deliveries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stale_idle_ms: 60_000,
            read_batch: 10,
            block_ms: 2_000,
            max_deliveries: 5,
        }
    }
}

/// Worker-pool sizing shared by every stage (default = hardware threads, clamped [2,16]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            size: cores.clamp(2, 16),
        }
    }
}

/// Server bind address used by each stage's health/stats endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

// --- WakeDetector -----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternGroup {
    pub kind: String,
    pub phrases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    pub primary: f32,
    pub secondary: f32,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            primary: 0.9,
            secondary: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyConfig {
    pub enabled: bool,
    pub max_edit_distance: usize,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_edit_distance: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionConfig {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for QuestionConfig {
    fn default() -> Self {
        Self {
            min_chars: 3,
            max_chars: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub cooldown_s: f64,
    pub max_per_minute: u32,
    pub per_session: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_s: 3.0,
            max_per_minute: 15,
            per_session: true,
        }
    }
}

/// Hot-reloadable pattern table, loaded from the JSON file named by
/// `WAKE_PATTERNS_FILE`. Patterns stay an ordered list (not a map) so
/// configuration ordering decides tie-breaks, per the matching algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternTableFile {
    pub patterns: Vec<PatternGroup>,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub fuzzy: FuzzyConfig,
    #[serde(default)]
    pub question: QuestionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for PatternTableFile {
    fn default() -> Self {
        Self {
            patterns: vec![
                PatternGroup {
                    kind: "primary".to_string(),
                    phrases: vec!["hey raven".to_string(), "ok raven".to_string()],
                },
                PatternGroup {
                    kind: "secondary".to_string(),
                    phrases: vec!["raven".to_string()],
                },
                PatternGroup {
                    kind: "conversational".to_string(),
                    phrases: vec!["raven can you".to_string(), "raven could you".to_string()],
                },
                PatternGroup {
                    kind: "question".to_string(),
                    phrases: vec!["raven what".to_string(), "raven how".to_string()],
                },
                PatternGroup {
                    kind: "fuzzy".to_string(),
                    phrases: vec!["hey haven".to_string(), "hey raving".to_string()],
                },
            ],
            thresholds: ThresholdsConfig::default(),
            fuzzy: FuzzyConfig::default(),
            question: QuestionConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeDetectorConfig {
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub worker_pool: WorkerPoolConfig,
    pub patterns_file: String,
}

impl Default for WakeDetectorConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8081,
            },
            logging: LoggingConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            patterns_file: "wake_patterns.json".to_string(),
        }
    }
}

// --- Responder ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_s: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_retries: u32,
}

impl Default for LlmGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            api_key: String::new(),
            model: "llama3".to_string(),
            timeout_s: 60,
            temperature: 0.7,
            max_tokens: 500,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HistoryBackend {
    #[default]
    Memory,
    Broker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub llm: LlmGatewayConfig,
    pub worker_pool: WorkerPoolConfig,
    pub history_turns: usize,
    pub history_backend: HistoryBackend,
    pub persona_preamble: String,
    pub fallback_response: String,
}

impl ResponderConfig {
    pub const DEFAULT_PERSONA: &'static str =
        "You are Raven, a concise and helpful meeting assistant. \
         Answer the question directly in one or two sentences.";
    pub const DEFAULT_FALLBACK: &'static str = "I don't have an answer for that right now.";
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            logging: LoggingConfig::default(),
            llm: LlmGatewayConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            history_turns: 10,
            history_backend: HistoryBackend::Memory,
            persona_preamble: Self::DEFAULT_PERSONA.to_string(),
            fallback_response: Self::DEFAULT_FALLBACK.to_string(),
        }
    }
}

// --- Synthesizer ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_s: u64,
    pub primary_language: String,
}

impl Default for TtsGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5002".to_string(),
            api_key: String::new(),
            timeout_s: 10,
            primary_language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub tts: TtsGatewayConfig,
    pub worker_pool: WorkerPoolConfig,
    pub max_text_length: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8082,
            },
            logging: LoggingConfig::default(),
            tts: TtsGatewayConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            max_text_length: 1000,
        }
    }
}

// --- Bot / Player ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub broker: BrokerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub connection_id: String,
    pub bot_manager_callback_url: Option<String>,
    pub playback_fallback_cap_s: f64,
    pub playback_grace_s: f64,
    pub drain_timeout_ms: u64,
    pub dedup_window: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8083,
            },
            logging: LoggingConfig::default(),
            connection_id: String::new(),
            bot_manager_callback_url: None,
            playback_fallback_cap_s: 30.0,
            playback_grace_s: 2.0,
            drain_timeout_ms: 10_000,
            dedup_window: 256,
        }
    }
}
