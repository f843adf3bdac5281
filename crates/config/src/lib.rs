// Configuration Management
//
// This crate handles all configuration loading for the Hey Raven pipeline
// binaries (wake_detector, responder, synthesizer, bot). It provides:
// - Configuration structs, one per stage
// - Environment variable loading with defaults
// - Loading of the wake-word pattern table from a JSON file
//
// This keeps configuration concerns separate from domain logic.

use std::{env, fs, path::Path};
use thiserror::Error;

pub mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read environment variable {name}: {source}")]
    EnvVar {
        name: String,
        #[source]
        source: env::VarError,
    },
    #[error("invalid value for environment variable {name}: {value}")]
    InvalidValue { name: String, value: String },
    #[error("failed to read pattern file {path}: {source}")]
    PatternFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse pattern file {path}: {source}")]
    PatternFileParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name: name.to_string(), value: raw }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(source) => Err(ConfigError::EnvVar { name: name.to_string(), source }),
    }
}

fn env_string_or(name: &str, default: String) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(raw) => Ok(raw),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(source) => Err(ConfigError::EnvVar { name: name.to_string(), source }),
    }
}

fn env_opt_string(name: &str) -> Result<Option<String>, ConfigError> {
    match env::var(name) {
        Ok(raw) => Ok(Some(raw)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(source) => Err(ConfigError::EnvVar { name: name.to_string(), source }),
    }
}

impl BrokerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            url: env_string_or("BROKER_URL", default.url)?,
            stale_idle_ms: env_or("BROKER_STALE_IDLE_MS", default.stale_idle_ms)?,
            read_batch: env_or("BROKER_READ_BATCH", default.read_batch)?,
            block_ms: env_or("BROKER_BLOCK_MS", default.block_ms)?,
            max_deliveries: env_or("BROKER_MAX_DELIVERIES", default.max_deliveries)?,
        })
    }
}

impl LoggingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            level: env_string_or("LOG_LEVEL", default.level)?,
            format: env_string_or("LOG_FORMAT", default.format)?,
        })
    }
}

impl WorkerPoolConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            size: env_or("WORKER_POOL_SIZE", default.size)?,
        })
    }
}

impl WakeDetectorConfig {
    /// Loads a `.env` file (if present) then reads configuration from the
    /// environment. Does not load `patterns_file`'s contents; call
    /// [`WakeDetectorConfig::load_patterns`] separately so the pattern table
    /// can be hot-reloaded without re-reading every other setting.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let default = Self::default();
        Ok(Self {
            broker: BrokerConfig::from_env()?,
            server: ServerConfig {
                host: env_string_or("WAKE_DETECTOR_HOST", default.server.host)?,
                port: env_or("WAKE_DETECTOR_PORT", default.server.port)?,
            },
            logging: LoggingConfig::from_env()?,
            worker_pool: WorkerPoolConfig::from_env()?,
            patterns_file: env_string_or("WAKE_PATTERNS_FILE", default.patterns_file)?,
        })
    }

    pub fn load_patterns(&self) -> Result<PatternTableFile, ConfigError> {
        load_pattern_table(&self.patterns_file)
    }
}

fn load_pattern_table(path: impl AsRef<Path>) -> Result<PatternTableFile, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(PatternTableFile::default());
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::PatternFileRead {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::PatternFileParse {
        path: path.display().to_string(),
        source,
    })
}

impl LlmGatewayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            base_url: env_string_or("LLM_BASE_URL", default.base_url)?,
            api_key: env_string_or("LLM_API_KEY", default.api_key)?,
            model: env_string_or("LLM_MODEL", default.model)?,
            timeout_s: env_or("LLM_TIMEOUT_S", default.timeout_s)?,
            temperature: env_or("LLM_TEMPERATURE", default.temperature)?,
            max_tokens: env_or("LLM_MAX_TOKENS", default.max_tokens)?,
            max_retries: env_or("LLM_MAX_RETRIES", default.max_retries)?,
        })
    }
}

impl ResponderConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let default = Self::default();
        let history_backend = match env_string_or(
            "RESPONDER_HISTORY_BACKEND",
            match default.history_backend {
                HistoryBackend::Memory => "memory".to_string(),
                HistoryBackend::Broker => "broker".to_string(),
            },
        )?
        .as_str()
        {
            "broker" => HistoryBackend::Broker,
            "memory" => HistoryBackend::Memory,
            other => {
                return Err(ConfigError::InvalidValue {
                    name: "RESPONDER_HISTORY_BACKEND".to_string(),
                    value: other.to_string(),
                })
            }
        };
        Ok(Self {
            broker: BrokerConfig::from_env()?,
            server: ServerConfig {
                host: env_string_or("RESPONDER_HOST", default.server.host)?,
                port: env_or("RESPONDER_PORT", default.server.port)?,
            },
            logging: LoggingConfig::from_env()?,
            llm: LlmGatewayConfig::from_env()?,
            worker_pool: WorkerPoolConfig::from_env()?,
            history_turns: env_or("RESPONDER_HISTORY_TURNS", default.history_turns)?,
            history_backend,
            persona_preamble: env_string_or("RESPONDER_PERSONA", default.persona_preamble)?,
            fallback_response: env_string_or("RESPONDER_FALLBACK", default.fallback_response)?,
        })
    }
}

impl TtsGatewayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            base_url: env_string_or("TTS_BASE_URL", default.base_url)?,
            api_key: env_string_or("TTS_API_KEY", default.api_key)?,
            timeout_s: env_or("TTS_TIMEOUT_S", default.timeout_s)?,
            primary_language: env_string_or("TTS_PRIMARY_LANGUAGE", default.primary_language)?,
        })
    }
}

impl SynthesizerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let default = Self::default();
        Ok(Self {
            broker: BrokerConfig::from_env()?,
            server: ServerConfig {
                host: env_string_or("SYNTHESIZER_HOST", default.server.host)?,
                port: env_or("SYNTHESIZER_PORT", default.server.port)?,
            },
            logging: LoggingConfig::from_env()?,
            tts: TtsGatewayConfig::from_env()?,
            worker_pool: WorkerPoolConfig::from_env()?,
            max_text_length: env_or("SYNTHESIZER_MAX_TEXT_LENGTH", default.max_text_length)?,
        })
    }
}

impl BotConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let default = Self::default();
        Ok(Self {
            broker: BrokerConfig::from_env()?,
            server: ServerConfig {
                host: env_string_or("BOT_HOST", default.server.host)?,
                port: env_or("BOT_PORT", default.server.port)?,
            },
            logging: LoggingConfig::from_env()?,
            connection_id: env_string_or("BOT_CONNECTION_ID", default.connection_id)?,
            bot_manager_callback_url: env_opt_string("BOT_MANAGER_CALLBACK_URL")?,
            playback_fallback_cap_s: env_or(
                "BOT_PLAYBACK_FALLBACK_CAP_S",
                default.playback_fallback_cap_s,
            )?,
            playback_grace_s: env_or("BOT_PLAYBACK_GRACE_S", default.playback_grace_s)?,
            drain_timeout_ms: env_or("BOT_DRAIN_TIMEOUT_MS", default.drain_timeout_ms)?,
            dedup_window: env_or("BOT_DEDUP_WINDOW", default.dedup_window)?,
        })
    }
}

/// Initializes the global tracing subscriber from a [`LoggingConfig`].
/// Shared by every stage binary so log shape is consistent across the pipeline.
pub fn init_tracing(logging: &LoggingConfig) {
    match logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(logging.level.clone())
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .compact()
                .with_env_filter(logging.level.clone())
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(logging.level.clone())
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_table_defaults_when_file_missing() {
        let table = load_pattern_table("/nonexistent/wake_patterns.json").unwrap();
        assert!(!table.patterns.is_empty());
    }

    #[test]
    fn pattern_table_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        let table = PatternTableFile::default();
        fs::write(&path, serde_json::to_string(&table).unwrap()).unwrap();
        let loaded = load_pattern_table(&path).unwrap();
        assert_eq!(loaded.patterns.len(), table.patterns.len());
    }

    #[test]
    fn defaults_are_internally_consistent() {
        assert!(WakeDetectorConfig::default().server.port != ResponderConfig::default().server.port);
        assert_eq!(ResponderConfig::default().history_backend, HistoryBackend::Memory);
    }
}
