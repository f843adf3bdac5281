//! The standard per-stage consumer loop (§4.5, §7): ensure the consumer
//! group exists, reclaim stale pending entries, read a batch, hand each
//! entry to a [`StageHandler`], and ack-or-leave-pending depending on the
//! outcome. WakeDetector, Responder and Synthesizer all run this same
//! loop and differ only in their `StageHandler` implementation — mirrors
//! the teacher's preference for one generic scaffolding function
//! (`retry_db!`, `ShutdownCoordinator::execute_stage`) reused by many
//! call sites rather than each stage hand-rolling its own loop.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::codec::Fields;
use crate::ports::Broker;

/// What a [`StageHandler`] decided to do with one entry.
pub enum StageOutcome {
    /// Processing succeeded; append each `(stream, fields)` pair then ack
    /// the input entry. An empty vec means "processed, nothing to emit"
    /// (e.g. the Responder swallowing a permanent LLM failure per §4.2).
    Emit(Vec<(String, Fields)>),
    /// A validation failure (§7): log with full id context, ack, drop. No
    /// dead-letter entry — this is an expected, non-poison shape mismatch.
    DropValidation(String),
    /// A permanent external failure (§7): log, ack, and record to the
    /// stage's dead-letter stream so it remains observable.
    DropPermanent(String),
    /// A transient failure (§7): log and leave the entry pending so a
    /// future `claim` redelivers it.
    Retry(String),
}

/// Implemented once per stage. `stage_name` doubles as the consumer-group
/// name and the tag attached to log lines and dead-letter entries.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage_name(&self) -> &'static str;

    async fn process_one(&self, id: &str, fields: &Fields) -> StageOutcome;
}

#[derive(Debug, Clone)]
pub struct StageRuntimeConfig {
    pub input_stream: String,
    pub consumer_name: String,
    pub stale_idle_ms: u64,
    pub read_batch: usize,
    pub block_ms: u64,
    pub max_deliveries: u32,
    /// Bounds how many sessions' entries may be in flight at once (§5): a
    /// `Semaphore`-gated worker pool wraps each entry's outbound LLM/TTS
    /// call so one slow backend response cannot starve the read loop.
    /// Entries sharing a `session_uid` are still processed in order within
    /// that session; different sessions run concurrently up to this bound.
    pub worker_pool_size: usize,
}

/// Runs `handler`'s loop against `broker` until `shutdown` reports `true`.
/// Returns once the current batch has fully drained past shutdown —
/// callers wrap this in the stage binary's `ShutdownCoordinator` stage so
/// in-flight LLM/TTS calls are allowed to finish before the process exits.
pub async fn run_stage<H: StageHandler + 'static>(
    broker: Arc<dyn Broker>,
    handler: H,
    config: StageRuntimeConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let group = handler.stage_name().to_string();
    let dlq_stream = crate::streams::dlq_of(&config.input_stream);
    let handler = Arc::new(handler);
    let permits = config.worker_pool_size.max(1);
    let semaphore = Arc::new(Semaphore::new(permits));

    if let Err(err) = broker.ensure_group(&config.input_stream, &group).await {
        error!(stage = %group, error = %err, "failed to ensure consumer group exists, stage cannot start");
        return;
    }

    info!(
        stage = %group,
        stream = %config.input_stream,
        consumer = %config.consumer_name,
        worker_pool_size = permits,
        "stage loop starting"
    );

    while !*shutdown.borrow() {
        let batch = match reclaim_and_read(&*broker, &config, &group, &dlq_stream).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(stage = %group, error = %err, "broker read failed, backing off");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        if batch.is_empty() {
            // read_group already blocked for block_ms; nothing more to wait for.
            continue;
        }

        // Partitioned by session_uid so causal order within a session is
        // preserved while unrelated sessions process concurrently, bounded
        // by the worker-pool semaphore (§5).
        let mut join_set = tokio::task::JoinSet::new();
        for session_entries in partition_by_session(batch) {
            let broker = broker.clone();
            let handler = handler.clone();
            let config = config.clone();
            let group = group.clone();
            let dlq_stream = dlq_stream.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await.expect("worker pool semaphore never closes");
                for (id, fields) in session_entries {
                    process_entry(&*broker, &*handler, &config, &group, &dlq_stream, &id, &fields).await;
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    info!(stage = %group, "stage loop draining, shutdown signal received");
}

/// Groups a batch by its `session_uid` top-level scalar (present on every
/// outbound record regardless of entity kind, per the codec module), so
/// entries from the same session stay ordered while different sessions
/// can run on separate worker-pool permits. Entries without a `session_uid`
/// (malformed records) each get their own singleton group.
fn partition_by_session(batch: Vec<(String, Fields)>) -> Vec<Vec<(String, Fields)>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<(String, Fields)>> = HashMap::new();
    for (id, fields) in batch {
        let key = fields.get("session_uid").cloned().unwrap_or_else(|| format!("__no_session__{id}"));
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push((id, fields));
    }
    order.into_iter().filter_map(|key| groups.remove(&key)).collect()
}

/// Reclaims pending entries idle longer than `stale_idle_ms`, dead-lettering
/// any that have exceeded `max_deliveries` (poison), then reads a fresh
/// batch. Claimed-but-not-poison entries are processed ahead of the fresh
/// read so redelivery happens promptly.
async fn reclaim_and_read(
    broker: &dyn Broker,
    config: &StageRuntimeConfig,
    group: &str,
    dlq_stream: &str,
) -> Result<Vec<(String, Fields)>, crate::ports::BrokerError> {
    let mut batch = Vec::new();

    let pending = broker.pending(&config.input_stream, group).await?;
    let deliveries: HashMap<String, u32> =
        pending.into_iter().map(|p| (p.id, p.deliveries)).collect();

    if !deliveries.is_empty() {
        let claimed = broker
            .claim(&config.input_stream, group, &config.consumer_name, config.stale_idle_ms)
            .await?;

        for (id, fields) in claimed {
            let delivery_count = deliveries.get(&id).copied().unwrap_or(1);
            if delivery_count >= config.max_deliveries {
                warn!(
                    stage = %group,
                    id = %id,
                    deliveries = delivery_count,
                    "entry exceeded max_deliveries, dead-lettering"
                );
                dead_letter(broker, dlq_stream, &fields, "max_deliveries_exceeded").await;
                broker.ack(&config.input_stream, group, &id).await.ok();
            } else {
                batch.push((id, fields));
            }
        }
    }

    let fresh = broker
        .read_group(
            &config.input_stream,
            group,
            &config.consumer_name,
            config.read_batch,
            config.block_ms,
        )
        .await?;
    batch.extend(fresh);

    Ok(batch)
}

async fn process_entry<H: StageHandler>(
    broker: &dyn Broker,
    handler: &H,
    config: &StageRuntimeConfig,
    group: &str,
    dlq_stream: &str,
    id: &str,
    fields: &Fields,
) {
    let outcome = AssertUnwindSafe(handler.process_one(id, fields))
        .catch_unwind()
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(&panic);
            error!(stage = %group, id = %id, panic = %message, "handler panicked, leaving entry pending");
            StageOutcome::Retry(message)
        }
    };

    match outcome {
        StageOutcome::Emit(outputs) => {
            for (stream, out_fields) in outputs {
                if let Err(err) = broker.append(&stream, out_fields).await {
                    error!(stage = %group, id = %id, stream = %stream, error = %err, "failed to append output, leaving input pending for redelivery");
                    return;
                }
            }
            if let Err(err) = broker.ack(&config.input_stream, group, id).await {
                error!(stage = %group, id = %id, error = %err, "failed to ack after successful processing");
            }
        }
        StageOutcome::DropValidation(reason) => {
            warn!(stage = %group, id = %id, reason = %reason, "validation failure, dropping entry");
            if let Err(err) = broker.ack(&config.input_stream, group, id).await {
                error!(stage = %group, id = %id, error = %err, "failed to ack dropped entry");
            }
        }
        StageOutcome::DropPermanent(reason) => {
            warn!(stage = %group, id = %id, reason = %reason, "permanent failure, dead-lettering entry");
            dead_letter(broker, dlq_stream, fields, &reason).await;
            if let Err(err) = broker.ack(&config.input_stream, group, id).await {
                error!(stage = %group, id = %id, error = %err, "failed to ack dead-lettered entry");
            }
        }
        StageOutcome::Retry(reason) => {
            debug!(stage = %group, id = %id, reason = %reason, "transient failure, leaving entry pending");
        }
    }
}

async fn dead_letter(broker: &dyn Broker, dlq_stream: &str, fields: &Fields, reason: &str) {
    let mut dlq_fields = fields.clone();
    dlq_fields.insert("dlq_reason".to_string(), reason.to_string());
    dlq_fields.insert(
        "dlq_deliveries".to_string(),
        dlq_fields
            .get("dlq_deliveries")
            .cloned()
            .unwrap_or_else(|| "1".to_string()),
    );
    if let Err(err) = broker.append(dlq_stream, dlq_fields).await {
        error!(dlq_stream = %dlq_stream, error = %err, "failed to write dead-letter entry");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `operation` and retries on transient failures with exponential
/// backoff plus jitter, shared by the Responder's LLM calls and any other
/// stage that needs the same shape (grounded on the teacher's `retry_db!`
/// macro, reimplemented as a free function since the error types differ
/// per port).
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation_name: &str,
    max_retries: u32,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    const INITIAL_BACKOFF_MS: u64 = 200;
    const BACKOFF_MULTIPLIER: f64 = 2.0;

    let mut attempt = 0u32;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt <= max_retries => {
                let jitter_ms = rand::random::<u64>() % (backoff_ms / 2 + 1);
                let sleep_ms = backoff_ms + jitter_ms;
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries,
                    error = %err,
                    sleep_ms,
                    "transient failure, retrying with backoff"
                );
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                backoff_ms = (backoff_ms as f64 * BACKOFF_MULTIPLIER) as u64;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("boom: {0}")]
    struct TestError(String);

    fn fields_with_session(session_uid: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("session_uid".to_string(), session_uid.to_string());
        fields
    }

    #[test]
    fn partition_by_session_keeps_same_session_entries_together_and_ordered() {
        let batch = vec![
            ("1-0".to_string(), fields_with_session("S1")),
            ("1-1".to_string(), fields_with_session("S2")),
            ("1-2".to_string(), fields_with_session("S1")),
        ];
        let groups = partition_by_session(batch);
        assert_eq!(groups.len(), 2);
        let s1_group = groups.iter().find(|g| g[0].1.get("session_uid").unwrap() == "S1").unwrap();
        assert_eq!(s1_group.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(), vec!["1-0", "1-2"]);
    }

    #[test]
    fn partition_by_session_isolates_entries_missing_session_uid() {
        let batch = vec![("1-0".to_string(), Fields::new()), ("1-1".to_string(), Fields::new())];
        let groups = partition_by_session(batch);
        assert_eq!(groups.len(), 2);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry_with_backoff(
            "test",
            3,
            |_e: &TestError| true,
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError("transient".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_failures() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry_with_backoff(
            "test",
            3,
            |_e: &TestError| false,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError("permanent".to_string())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry_with_backoff(
            "test",
            2,
            |_e: &TestError| true,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError("always transient".to_string())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
