use crate::model::{Checkpoint, Table};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub(crate) const WATCHER_BACKEND_UNKNOWN: u64 = 0;
pub(crate) const WATCHER_BACKEND_NATIVE: u64 = 1;
pub(crate) const WATCHER_BACKEND_POLL: u64 = 2;
pub(crate) const WATCHER_BACKEND_MIXED: u64 = 3;

pub(crate) fn watcher_backend_label(value: u64) -> &'static str {
    match value {
        WATCHER_BACKEND_NATIVE => "native",
        WATCHER_BACKEND_POLL => "poll",
        WATCHER_BACKEND_MIXED => "mixed",
        _ => "unknown",
    }
}

#[derive(Default)]
pub struct Metrics {
    pub lines_read: AtomicU64,
    pub rows_written: AtomicU64,
    pub parse_errors: AtomicU64,
    pub file_access_errors: AtomicU64,
    pub ingest_retries: AtomicU64,
    pub transient_failures: AtomicU64,
    pub permanent_failures: AtomicU64,
    pub dead_letter_batches: AtomicU64,
    pub checkpoint_commits: AtomicU64,
    pub last_flush_ms: AtomicU64,
    pub queue_depth: AtomicU64,
    pub files_active: AtomicU64,
    pub watcher_error_count: AtomicU64,
    pub watcher_reset_count: AtomicU64,
    pub watcher_last_reset_unix_ms: AtomicU64,
    pub watcher_backend_state: AtomicU64,
    pub watcher_registrations: AtomicU64,
    pending_batches: Mutex<BTreeMap<Table, u64>>,
    last_error: Mutex<String>,
}

impl Metrics {
    pub fn record_error(&self, message: impl Into<String>) {
        *self
            .last_error
            .lock()
            .expect("metrics last_error mutex poisoned") = message.into();
    }

    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .expect("metrics last_error mutex poisoned")
            .clone()
    }

    /// A batch left the assembler and awaits its ingestion outcome.
    pub fn batch_opened(&self, table: Table) {
        let mut pending = self
            .pending_batches
            .lock()
            .expect("metrics pending_batches mutex poisoned");
        *pending.entry(table).or_insert(0) += 1;
    }

    pub fn batch_closed(&self, table: Table) {
        let mut pending = self
            .pending_batches
            .lock()
            .expect("metrics pending_batches mutex poisoned");
        if let Some(count) = pending.get_mut(&table) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(&table);
            }
        }
    }

    pub fn pending_batches(&self) -> BTreeMap<String, u64> {
        self.pending_batches
            .lock()
            .expect("metrics pending_batches mutex poisoned")
            .iter()
            .map(|(table, count)| (table.name().to_string(), *count))
            .collect()
    }

    pub fn error_counts(&self) -> ErrorCounts {
        ErrorCounts {
            parse: self.parse_errors.load(Ordering::Relaxed),
            file_access: self.file_access_errors.load(Ordering::Relaxed),
            transient_ingest: self.transient_failures.load(Ordering::Relaxed),
            permanent_ingest: self.permanent_failures.load(Ordering::Relaxed),
            dead_letter_batches: self.dead_letter_batches.load(Ordering::Relaxed),
            watcher: self.watcher_error_count.load(Ordering::Relaxed),
        }
    }

    pub fn watcher_backend(&self) -> &'static str {
        watcher_backend_label(self.watcher_backend_state.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    pub parse: u64,
    pub file_access: u64,
    pub transient_ingest: u64,
    pub permanent_ingest: u64,
    pub dead_letter_batches: u64,
    pub watcher: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommittedOffset {
    pub path: String,
    pub offset: u64,
    pub line_no: u64,
    pub generation: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OffsetSummary {
    pub files: usize,
    pub committed_bytes: u64,
    pub max_offset: u64,
    pub rotations: u64,
    pub last_commit_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub files_tracked: usize,
    pub offsets: OffsetSummary,
    pub committed: Vec<CommittedOffset>,
    pub pending_batch_counts: BTreeMap<String, u64>,
    pub error_counts: ErrorCounts,
    pub lines_read: u64,
    pub rows_written: u64,
    pub ingest_retries: u64,
    pub queue_depth: u64,
    pub files_active: u64,
    pub watcher_backend: String,
    pub last_error: String,
}

pub fn summarize_offsets(checkpoints: &[Checkpoint]) -> OffsetSummary {
    OffsetSummary {
        files: checkpoints.len(),
        committed_bytes: checkpoints.iter().map(|cp| cp.last_offset).sum(),
        max_offset: checkpoints
            .iter()
            .map(|cp| cp.last_offset)
            .max()
            .unwrap_or(0),
        rotations: checkpoints
            .iter()
            .map(|cp| u64::from(cp.source_generation.saturating_sub(1)))
            .sum(),
        last_commit_unix_ms: checkpoints
            .iter()
            .map(|cp| cp.updated_at_unix_ms)
            .max()
            .unwrap_or(0),
    }
}

pub fn build_status(checkpoints: &[Checkpoint], metrics: &Metrics) -> SyncStatus {
    let mut committed: Vec<CommittedOffset> = checkpoints
        .iter()
        .map(|cp| CommittedOffset {
            path: cp.source_file.clone(),
            offset: cp.last_offset,
            line_no: cp.last_line_no,
            generation: cp.source_generation,
        })
        .collect();
    committed.sort_by(|a, b| a.path.cmp(&b.path));

    SyncStatus {
        files_tracked: checkpoints.len(),
        offsets: summarize_offsets(checkpoints),
        committed,
        pending_batch_counts: metrics.pending_batches(),
        error_counts: metrics.error_counts(),
        lines_read: metrics.lines_read.load(Ordering::Relaxed),
        rows_written: metrics.rows_written.load(Ordering::Relaxed),
        ingest_retries: metrics.ingest_retries.load(Ordering::Relaxed),
        queue_depth: metrics.queue_depth.load(Ordering::Relaxed),
        files_active: metrics.files_active.load(Ordering::Relaxed),
        watcher_backend: metrics.watcher_backend().to_string(),
        last_error: metrics.last_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileId;

    #[test]
    fn pending_batch_gauge_drops_empty_tables() {
        let metrics = Metrics::default();
        metrics.batch_opened(Table::Messages);
        metrics.batch_opened(Table::Messages);
        metrics.batch_opened(Table::ToolUsage);
        metrics.batch_closed(Table::ToolUsage);
        metrics.batch_closed(Table::Messages);

        let pending = metrics.pending_batches();
        assert_eq!(pending.get("messages"), Some(&1));
        assert!(!pending.contains_key("tool_usage"));
    }

    #[test]
    fn status_summarizes_committed_offsets() {
        let mut a = crate::model::Checkpoint::initial(
            "live",
            &FileId {
                path: "/logs/b.jsonl".to_string(),
                device: 1,
                inode: 2,
            },
        );
        a.last_offset = 300;
        a.source_generation = 2;
        let mut b = a.clone();
        b.source_file = "/logs/a.jsonl".to_string();
        b.last_offset = 100;
        b.source_generation = 1;

        let metrics = Metrics::default();
        metrics.parse_errors.fetch_add(2, Ordering::Relaxed);
        metrics.record_error("boom");

        let status = build_status(&[a, b], &metrics);
        assert_eq!(status.files_tracked, 2);
        assert_eq!(status.offsets.committed_bytes, 400);
        assert_eq!(status.offsets.max_offset, 300);
        assert_eq!(status.offsets.rotations, 1);
        assert_eq!(status.committed[0].path, "/logs/a.jsonl");
        assert_eq!(status.error_counts.parse, 2);
        assert_eq!(status.last_error, "boom");
        assert_eq!(status.watcher_backend, "unknown");
    }
}
