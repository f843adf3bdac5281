use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker::RedisBroker;
use config::{init_tracing, SynthesizerConfig};
use pipeline_domain::health::{HealthProvider, HealthResponse};
use pipeline_domain::{
    install_signal_handler, run_stage, streams, Broker, ShutdownCoordinator,
    ShutdownStage, StageRuntimeConfig, TtsGateway,
};
use synthesizer::{SynthesizerCounters, SynthesizerHandler};
use tts_gateway::{CompositeTtsGateway, LocalFallbackEngine, NetworkedTtsEngine};

struct SynthesizerHealth {
    broker: Arc<dyn Broker>,
    tts: Arc<dyn TtsGateway>,
    counters: Arc<SynthesizerCounters>,
}

#[async_trait]
impl HealthProvider for SynthesizerHealth {
    async fn health(&self) -> HealthResponse {
        let broker_reachable = self.broker.stream_info(streams::LLM_RESPONSES).await.is_ok();
        let backend_reachable = self.tts.health().await.is_ok();
        HealthResponse {
            status: if broker_reachable && backend_reachable { "ok" } else { "degraded" },
            broker_reachable,
            backend_reachable,
            last_success_at: self.counters.last_success_at(),
        }
    }

    fn stats(&self) -> serde_json::Value {
        let mut value = self.counters.snapshot();
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert("engines".to_string(), serde_json::json!(self.tts.stats()));
        }
        value
    }
}

#[tokio::main]
async fn main() {
    let config = SynthesizerConfig::load().unwrap_or_else(|err| {
        eprintln!("failed to load synthesizer configuration: {err}");
        std::process::exit(1);
    });

    init_tracing(&config.logging);
    tracing::info!(host = %config.server.host, port = config.server.port, "synthesizer starting");

    let broker = match RedisBroker::connect(&config.broker.url).await {
        Ok(broker) => Arc::new(broker) as Arc<dyn Broker>,
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to broker, cannot start");
            std::process::exit(1);
        }
    };

    let primary = NetworkedTtsEngine::new(
        config.tts.base_url.clone(),
        config.tts.api_key.clone(),
        Duration::from_secs(config.tts.timeout_s),
    );
    let tts: Arc<dyn TtsGateway> = Arc::new(CompositeTtsGateway::new(primary, LocalFallbackEngine::new()));

    let handler = SynthesizerHandler::new(tts.clone(), config.tts.primary_language.clone(), config.max_text_length);
    let counters = handler.counters.clone();

    let health_provider = Arc::new(SynthesizerHealth { broker: broker.clone(), tts, counters });

    let mut shutdown_rx = install_signal_handler();
    let health_shutdown_rx = shutdown_rx.clone();

    let health_task = tokio::spawn(pipeline_domain::health::serve(
        &config.server.host,
        config.server.port,
        health_provider,
        health_shutdown_rx,
    ));

    let stage_config = StageRuntimeConfig {
        input_stream: streams::LLM_RESPONSES.to_string(),
        consumer_name: format!("synthesizer-{}", std::process::id()),
        stale_idle_ms: config.broker.stale_idle_ms,
        read_batch: config.broker.read_batch,
        block_ms: config.broker.block_ms,
        max_deliveries: config.broker.max_deliveries,
        worker_pool_size: config.worker_pool.size,
    };

    let stage_task = tokio::spawn(run_stage(broker, handler, stage_config, shutdown_rx.clone()));

    let _ = shutdown_rx.changed().await;

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
    coordinator.start();
    coordinator
        .execute_stage(ShutdownStage { name: "drain_stage_loop", timeout: Duration::from_secs(20) }, || async {
            let _ = stage_task.await;
        })
        .await;
    coordinator
        .execute_stage(ShutdownStage { name: "drain_health_server", timeout: Duration::from_secs(5) }, || async {
            let _ = health_task.await;
        })
        .await;
    coordinator.finish();
}
