use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker::RedisBroker;
use config::{init_tracing, WakeDetectorConfig};
use pipeline_domain::health::{HealthProvider, HealthResponse};
use pipeline_domain::{
    install_signal_handler, run_stage, streams, Broker, ShutdownCoordinator,
    ShutdownStage, StageRuntimeConfig,
};
use tokio::sync::RwLock;
use wake_detector::{CompiledPatternTable, RateLimiter, WakeDetectorCounters, WakeDetectorHandler};

struct WakeDetectorHealth {
    broker: Arc<dyn Broker>,
    counters: Arc<WakeDetectorCounters>,
}

#[async_trait]
impl HealthProvider for WakeDetectorHealth {
    async fn health(&self) -> HealthResponse {
        let broker_reachable = self.broker.stream_info(streams::TRANSCRIPTS).await.is_ok();
        HealthResponse {
            status: if broker_reachable { "ok" } else { "degraded" },
            broker_reachable,
            backend_reachable: true,
            last_success_at: self.counters.last_success_at(),
        }
    }

    fn stats(&self) -> serde_json::Value {
        self.counters.snapshot()
    }
}

#[tokio::main]
async fn main() {
    let config = WakeDetectorConfig::load().unwrap_or_else(|err| {
        eprintln!("failed to load wake_detector configuration: {err}");
        std::process::exit(1);
    });

    init_tracing(&config.logging);
    tracing::info!(host = %config.server.host, port = config.server.port, "wake_detector starting");

    let pattern_file = config.load_patterns().unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to load wake patterns file, cannot start");
        std::process::exit(1);
    });
    let compiled = CompiledPatternTable::compile(&pattern_file).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to compile wake patterns, cannot start");
        std::process::exit(1);
    });
    let patterns = Arc::new(RwLock::new(compiled));
    spawn_hot_reload(config.clone(), patterns.clone());

    let broker = match RedisBroker::connect(&config.broker.url).await {
        Ok(broker) => Arc::new(broker) as Arc<dyn Broker>,
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to broker, cannot start");
            std::process::exit(1);
        }
    };

    let rate_limiter = Arc::new(RateLimiter::new(pattern_file.rate_limit.clone()));
    spawn_rate_limiter_gc(rate_limiter.clone());
    let handler = WakeDetectorHandler::new(patterns, rate_limiter);
    let counters = handler.counters.clone();

    let health_provider = Arc::new(WakeDetectorHealth { broker: broker.clone(), counters });

    let mut shutdown_rx = install_signal_handler();
    let health_shutdown_rx = shutdown_rx.clone();

    let health_task = tokio::spawn(pipeline_domain::health::serve(
        &config.server.host,
        config.server.port,
        health_provider,
        health_shutdown_rx,
    ));

    let stage_config = StageRuntimeConfig {
        input_stream: streams::TRANSCRIPTS.to_string(),
        consumer_name: format!("wake_detector-{}", std::process::id()),
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

/// Opportunistically garbage-collects rate-limit state for sessions that
/// have gone quiet, per §4.1 step 5 ("old timestamps are garbage-collected
/// opportunistically").
fn spawn_rate_limiter_gc(rate_limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.gc(Duration::from_secs(600));
        }
    });
}

/// Installs the SIGHUP-equivalent hot-reload listener (§4.1). Unix-only,
/// matching the teacher's container-deployment assumption.
fn spawn_hot_reload(config: WakeDetectorConfig, patterns: Arc<RwLock<CompiledPatternTable>>) {
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install SIGHUP handler, hot-reload disabled");
                    return;
                }
            };
            loop {
                hangup.recv().await;
                tracing::info!(path = %config.patterns_file, "SIGHUP received, reloading wake patterns");
                match config
                    .load_patterns()
                    .map_err(|err| err.to_string())
                    .and_then(|file| CompiledPatternTable::compile(&file).map_err(|err| err.to_string()))
                {
                    Ok(compiled) => {
                        *patterns.write().await = compiled;
                        tracing::info!("wake patterns reloaded successfully");
                    }
                    Err(err) => tracing::error!(error = %err, "failed to reload wake patterns, keeping previous table"),
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (config, patterns);
    }
}
