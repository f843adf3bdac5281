//! `GET /health` and `GET /stats` for every stage binary (§6), mirroring
//! the teacher's `routes/health.rs` shape but generic over a per-stage
//! [`HealthProvider`] so the four stage binaries share one router instead
//! of each hand-rolling axum wiring.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json as ResponseJson;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker_reachable: bool,
    pub backend_reachable: bool,
    pub last_success_at: Option<String>,
}

/// Implemented once per stage binary (`wake_detector`, `responder`,
/// `synthesizer`, `bot`): reports liveness plus whatever counters that
/// stage's `/stats` endpoint should expose.
#[async_trait::async_trait]
pub trait HealthProvider: Send + Sync + 'static {
    async fn health(&self) -> HealthResponse;

    fn stats(&self) -> serde_json::Value;
}

async fn health_handler<P: HealthProvider>(State(provider): State<Arc<P>>) -> ResponseJson<HealthResponse> {
    ResponseJson(provider.health().await)
}

async fn stats_handler<P: HealthProvider>(State(provider): State<Arc<P>>) -> ResponseJson<serde_json::Value> {
    ResponseJson(provider.stats())
}

/// Serves `/health` and `/stats` until `shutdown` reports `true`. Runs as
/// its own `tokio::task` per stage binary, independent of the broker
/// consumer loop so a stuck backend call never blocks health checks.
pub async fn serve<P: HealthProvider>(
    host: &str,
    port: u16,
    provider: Arc<P>,
    mut shutdown: watch::Receiver<bool>,
) {
    let app = Router::new()
        .route("/health", get(health_handler::<P>))
        .route("/stats", get(stats_handler::<P>))
        .with_state(provider);

    let addr = format!("{host}:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(address = %addr, error = %err, "failed to bind health/stats listener");
            return;
        }
    };

    tracing::info!(address = %addr, "health/stats endpoint listening");

    let shutdown_signal = async move {
        let _ = shutdown.changed().await;
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await {
        tracing::error!(error = %err, "health/stats server exited with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider;

    #[async_trait::async_trait]
    impl HealthProvider for FakeProvider {
        async fn health(&self) -> HealthResponse {
            HealthResponse {
                status: "ok",
                broker_reachable: true,
                backend_reachable: true,
                last_success_at: None,
            }
        }

        fn stats(&self) -> serde_json::Value {
            serde_json::json!({"processed": 0})
        }
    }

    #[tokio::test]
    async fn health_handler_reports_status() {
        let provider = Arc::new(FakeProvider);
        let ResponseJson(response) = health_handler(State(provider)).await;
        assert_eq!(response.status, "ok");
    }

    #[tokio::test]
    async fn stats_handler_returns_provider_json() {
        let provider = Arc::new(FakeProvider);
        let ResponseJson(value) = stats_handler(State(provider)).await;
        assert_eq!(value["processed"], 0);
    }
}
