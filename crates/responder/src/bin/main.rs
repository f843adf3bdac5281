use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker::RedisBroker;
use config::{init_tracing, HistoryBackend, ResponderConfig};
use inference_gateway::OpenAiCompatibleLlmGateway;
use pipeline_domain::health::{HealthProvider, HealthResponse};
use pipeline_domain::{
    install_signal_handler, run_stage, streams, Broker, LlmGateway,
    ShutdownCoordinator, ShutdownStage, StageRuntimeConfig,
};
use responder::history::ConversationHistory;
use responder::{BrokerHistory, MemoryHistory, ResponderCounters, ResponderHandler};

struct ResponderHealth {
    broker: Arc<dyn Broker>,
    llm: Arc<dyn LlmGateway>,
    counters: Arc<ResponderCounters>,
}

#[async_trait]
impl HealthProvider for ResponderHealth {
    async fn health(&self) -> HealthResponse {
        let broker_reachable = self.broker.stream_info(streams::HEY_RAVEN_COMMANDS).await.is_ok();
        let backend_reachable = self.llm.health().await.is_ok();
        HealthResponse {
            status: if broker_reachable && backend_reachable { "ok" } else { "degraded" },
            broker_reachable,
            backend_reachable,
            last_success_at: self.counters.last_success_at(),
        }
    }

    fn stats(&self) -> serde_json::Value {
        self.counters.snapshot()
    }
}

#[tokio::main]
async fn main() {
    let config = ResponderConfig::load().unwrap_or_else(|err| {
        eprintln!("failed to load responder configuration: {err}");
        std::process::exit(1);
    });

    init_tracing(&config.logging);
    tracing::info!(host = %config.server.host, port = config.server.port, "responder starting");

    let broker = match RedisBroker::connect(&config.broker.url).await {
        Ok(broker) => Arc::new(broker) as Arc<dyn Broker>,
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to broker, cannot start");
            std::process::exit(1);
        }
    };

    let llm: Arc<dyn LlmGateway> = Arc::new(OpenAiCompatibleLlmGateway::new(
        config.llm.base_url.clone(),
        config.llm.api_key.clone(),
        Duration::from_secs(config.llm.timeout_s),
    ));

    let history: Arc<dyn ConversationHistory> = match config.history_backend {
        HistoryBackend::Memory => Arc::new(MemoryHistory::new(config.history_turns)),
        HistoryBackend::Broker => Arc::new(BrokerHistory::new(broker.clone(), config.history_turns)),
    };

    let handler = ResponderHandler::new(
        llm.clone(),
        history,
        config.llm.model.clone(),
        config.llm.temperature,
        config.llm.max_tokens,
        config.llm.max_retries,
        config.persona_preamble.clone(),
        config.fallback_response.clone(),
    );
    let counters = handler.counters.clone();

    let health_provider = Arc::new(ResponderHealth { broker: broker.clone(), llm, counters });

    let mut shutdown_rx = install_signal_handler();
    let health_shutdown_rx = shutdown_rx.clone();

    let health_task = tokio::spawn(pipeline_domain::health::serve(
        &config.server.host,
        config.server.port,
        health_provider,
        health_shutdown_rx,
    ));

    let stage_config = StageRuntimeConfig {
        input_stream: streams::HEY_RAVEN_COMMANDS.to_string(),
        consumer_name: format!("responder-{}", std::process::id()),
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
