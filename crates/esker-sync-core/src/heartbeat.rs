use crate::checkpoint::{CheckpointStore, LIVE_SCOPE};
use crate::metrics::Metrics;
use crate::model::Table;
use crate::store::EventStore;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(crate) fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn saturating_u32(value: u64) -> u32 {
    value.min(u32::MAX as u64) as u32
}

pub(crate) fn heartbeat_row(files_tracked: usize, metrics: &Metrics) -> Value {
    json!({
        "host": host_name(),
        "service_version": env!("CARGO_PKG_VERSION"),
        "files_tracked": saturating_u32(files_tracked as u64),
        "files_active": saturating_u32(metrics.files_active.load(Ordering::Relaxed)),
        "queue_depth": metrics.queue_depth.load(Ordering::Relaxed),
        "rows_written": metrics.rows_written.load(Ordering::Relaxed),
        "parse_errors": metrics.parse_errors.load(Ordering::Relaxed),
        "dead_letter_batches": metrics.dead_letter_batches.load(Ordering::Relaxed),
        "retries": metrics.ingest_retries.load(Ordering::Relaxed),
        "flush_latency_ms": saturating_u32(metrics.last_flush_ms.load(Ordering::Relaxed)),
        "watcher_backend": metrics.watcher_backend(),
        "watcher_error_count": metrics.watcher_error_count.load(Ordering::Relaxed),
        "watcher_reset_count": metrics.watcher_reset_count.load(Ordering::Relaxed),
        "last_error": metrics.last_error(),
    })
}

async fn emit_heartbeat(store: &dyn EventStore, checkpoints: &CheckpointStore, metrics: &Metrics) {
    let files_tracked = checkpoints.scope_entries(LIVE_SCOPE).await.len();
    let row = heartbeat_row(files_tracked, metrics);
    if let Err(exc) = store
        .insert_rows(Table::IngestHeartbeats, &[row], "")
        .await
    {
        warn!("heartbeat insert failed: {exc}");
    }
}

pub(crate) fn spawn_heartbeat_task(
    store: Arc<dyn EventStore>,
    checkpoints: Arc<CheckpointStore>,
    metrics: Arc<Metrics>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    emit_heartbeat(store.as_ref(), &checkpoints, &metrics).await;
                }
            }
        }
    })
}
