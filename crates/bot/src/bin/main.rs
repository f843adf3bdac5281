use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bot::manager_callback::exit_code;
use bot::{
    run_bridge_receive_loop, run_playback_loop, AudioSessionState, BotExitReport, ChannelBrowserBridge,
    PlaybackConfig, PlaybackState, PlayerCounters, PlayerIngestHandler,
};
use broker::RedisBroker;
use config::{init_tracing, BotConfig};
use pipeline_domain::health::{HealthProvider, HealthResponse};
use pipeline_domain::{
    install_signal_handler, run_stage, streams, Broker, BrowserBridge, ShutdownCoordinator,
    ShutdownStage, StageRuntimeConfig,
};

struct BotHealth {
    broker: Arc<dyn Broker>,
    session: Arc<AudioSessionState>,
    counters: Arc<PlayerCounters>,
}

#[async_trait]
impl HealthProvider for BotHealth {
    async fn health(&self) -> HealthResponse {
        let broker_reachable = self.broker.stream_info(streams::TTS_AUDIO_QUEUE).await.is_ok();
        HealthResponse {
            status: if broker_reachable { "ok" } else { "degraded" },
            broker_reachable,
            backend_reachable: true,
            last_success_at: self.counters.last_success_at(),
        }
    }

    fn stats(&self) -> serde_json::Value {
        let mut value = self.counters.snapshot();
        let binding = self.session.binding_snapshot();
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert(
                "playback_state".to_string(),
                serde_json::json!(match self.session.state() {
                    PlaybackState::Idle => "idle",
                    PlaybackState::Playing => "playing",
                    PlaybackState::Draining => "draining",
                }),
            );
            map.insert("queue_len".to_string(), serde_json::json!(self.session.queue_len()));
            map.insert("connection_id".to_string(), serde_json::json!(binding.connection_id));
            map.insert("recognizer_session_uid".to_string(), serde_json::json!(binding.recognizer_session_uid));
        }
        value
    }
}

#[tokio::main]
async fn main() {
    let config = BotConfig::load().unwrap_or_else(|err| {
        eprintln!("failed to load bot configuration: {err}");
        std::process::exit(exit_code::FATAL);
    });

    init_tracing(&config.logging);
    tracing::info!(connection_id = %config.connection_id, host = %config.server.host, port = config.server.port, "bot starting");

    let broker = match RedisBroker::connect(&config.broker.url).await {
        Ok(broker) => Arc::new(broker) as Arc<dyn Broker>,
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to broker, cannot start");
            std::process::exit(exit_code::FATAL);
        }
    };

    let session = Arc::new(AudioSessionState::new(config.connection_id.clone(), config.dedup_window));
    let bridge: Arc<dyn BrowserBridge> = Arc::new(ChannelBrowserBridge::new(true));

    let handler = PlayerIngestHandler::new(session.clone());
    let counters = handler.counters.clone();

    let health_provider = Arc::new(BotHealth { broker: broker.clone(), session: session.clone(), counters: counters.clone() });

    let mut shutdown_rx = install_signal_handler();

    let health_task = tokio::spawn(pipeline_domain::health::serve(
        &config.server.host,
        config.server.port,
        health_provider,
        shutdown_rx.clone(),
    ));

    let bridge_recv_task = tokio::spawn(run_bridge_receive_loop(session.clone(), bridge.clone()));

    let playback_config = PlaybackConfig {
        fallback_cap_s: config.playback_fallback_cap_s,
        grace_s: config.playback_grace_s,
    };
    let playback_task = tokio::spawn(run_playback_loop(
        session.clone(),
        bridge.clone(),
        playback_config,
        counters,
        shutdown_rx.clone(),
    ));

    let stage_config = StageRuntimeConfig {
        input_stream: streams::TTS_AUDIO_QUEUE.to_string(),
        consumer_name: format!("bot-{}-{}", config.connection_id, std::process::id()),
        stale_idle_ms: config.broker.stale_idle_ms,
        read_batch: config.broker.read_batch,
        block_ms: config.broker.block_ms,
        max_deliveries: config.broker.max_deliveries,
        worker_pool_size: 1, // strict FIFO: one bot process plays one clip at a time (§4.4)
    };
    let stage_task = tokio::spawn(run_stage(broker, handler, stage_config, shutdown_rx.clone()));

    let _ = shutdown_rx.changed().await;
    tracing::info!("shutdown signal received, entering Draining");

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
    coordinator.start();
    coordinator
        .execute_stage(ShutdownStage { name: "drain_ingest_stage", timeout: Duration::from_secs(2) }, || async {
            let _ = stage_task.await;
        })
        .await;
    coordinator
        .execute_stage(ShutdownStage { name: "drain_current_playback", timeout: Duration::from_millis(config.drain_timeout_ms) }, || async {
            let _ = playback_task.await;
        })
        .await;
    coordinator
        .execute_stage(ShutdownStage { name: "drain_health_server", timeout: Duration::from_secs(5) }, || async {
            let _ = health_task.await;
        })
        .await;
    coordinator.finish();
    bridge_recv_task.abort();

    let report = BotExitReport {
        connection_id: &config.connection_id,
        exit_code: exit_code::SIGTERM,
        reason: "shutdown signal received",
        error_details: None,
    };
    bot::notify_manager(&config.bot_manager_callback_url, &report).await;
}
