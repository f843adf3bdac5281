//! Staged graceful shutdown shared by every stage binary, grounded on the
//! teacher's `ShutdownCoordinator` (`crates/database/src/shutdown_coordinator.rs`):
//! a bounded total timeout subdivided into named stages, each run under its
//! own sub-timeout so one slow stage cannot eat the whole budget. The bot's
//! `Draining` state (§4.4) is the one caller that inspects `remaining_time`
//! directly rather than just running stages in sequence.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStageResult {
    Success,
    SlowCompletion,
    Timeout,
}

pub struct ShutdownStage {
    pub name: &'static str,
    pub timeout: Duration,
}

pub struct ShutdownCoordinator {
    total_timeout: Duration,
    start_time: Option<Instant>,
}

impl ShutdownCoordinator {
    pub fn new(total_timeout: Duration) -> Self {
        Self { total_timeout, start_time: None }
    }

    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        info!(timeout_s = self.total_timeout.as_secs_f32(), "starting graceful shutdown sequence");
    }

    pub async fn execute_stage<F, Fut>(&self, stage: ShutdownStage, operation: F) -> ShutdownStageResult
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let stage_start = Instant::now();
        let remaining = self.remaining_time();

        debug!(stage = stage.name, timeout_s = stage.timeout.as_secs_f32(), remaining_s = remaining.as_secs_f32(), "starting shutdown stage");

        if remaining.is_zero() {
            warn!(stage = stage.name, "no time remaining, skipping stage");
            return ShutdownStageResult::Timeout;
        }

        let stage_timeout = stage.timeout.min(remaining);
        let result = tokio::time::timeout(stage_timeout, operation()).await;
        let elapsed = stage_start.elapsed();

        match result {
            Ok(()) if elapsed > stage.timeout => {
                debug!(stage = stage.name, elapsed_s = elapsed.as_secs_f32(), "stage completed slower than recommended");
                ShutdownStageResult::SlowCompletion
            }
            Ok(()) => ShutdownStageResult::Success,
            Err(_) => {
                warn!(stage = stage.name, elapsed_s = elapsed.as_secs_f32(), "stage exceeded its timeout");
                ShutdownStageResult::Timeout
            }
        }
    }

    pub fn remaining_time(&self) -> Duration {
        match self.start_time {
            Some(start) => self.total_timeout.saturating_sub(start.elapsed()),
            None => self.total_timeout,
        }
    }

    pub fn has_exceeded_timeout(&self) -> bool {
        self.remaining_time().is_zero()
    }

    pub fn finish(&self) {
        let elapsed = self.start_time.map(|s| s.elapsed()).unwrap_or_default();
        info!(elapsed_s = elapsed.as_secs_f32(), "graceful shutdown completed");
    }
}

/// Installs a `ctrl_c` + SIGTERM (Unix) listener that flips a
/// `watch::Sender<bool>` to `true` once, shared by every stage's `main`.
pub fn install_signal_handler() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stage_succeeds_within_timeout() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.start();
        let stage = ShutdownStage { name: "drain", timeout: Duration::from_secs(1) };
        let result = coordinator.execute_stage(stage, || async {}).await;
        assert_eq!(result, ShutdownStageResult::Success);
    }

    #[tokio::test]
    async fn stage_reports_timeout_when_operation_hangs() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(200));
        coordinator.start();
        let stage = ShutdownStage { name: "slow", timeout: Duration::from_millis(20) };
        let result = coordinator
            .execute_stage(stage, || async { tokio::time::sleep(Duration::from_secs(5)).await })
            .await;
        assert_eq!(result, ShutdownStageResult::Timeout);
    }

    #[test]
    fn remaining_time_before_start_is_total() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(10));
        assert_eq!(coordinator.remaining_time(), Duration::from_secs(10));
    }
}
