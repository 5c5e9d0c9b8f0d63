use crate::batch::{Batch, BatchAssembler, BatchLimits};
use crate::checkpoint::{checkpoint_key, CheckpointStore, LIVE_SCOPE};
use crate::classify::{error_row, Classifier, ToolCorrelation};
use crate::discovery::{detect_change, ChangeKind};
use crate::error::{IngestErrorKind, SyncError, SyncResult};
use crate::ingest::{IngestOutcome, IngestionClient};
use crate::metrics::Metrics;
use crate::model::{Checkpoint, FileId, Table};
use crate::tailer::{window_fingerprint, Tailer};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one tail cycle did to one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub path: String,
    pub lines: u64,
    pub records: u64,
    pub rows: u64,
    pub parse_errors: u64,
    pub tokens: u64,
    pub batches: u64,
    pub dead_lettered_batches: u64,
    pub permanent_failures: u64,
    pub committed_offset: u64,
    pub generation: u32,
    pub reset: bool,
    pub deleted: bool,
    pub skipped: bool,
    pub cancelled: bool,
}

impl FileReport {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }

    /// Every batch of the cycle was rejected as permanently unwritable.
    pub fn all_rejected(&self) -> bool {
        self.batches > 0 && self.permanent_failures == self.batches
    }
}

/// Everything a tail cycle needs, shared by live sync and migration runs.
pub struct PipelineContext {
    pub checkpoints: Arc<CheckpointStore>,
    pub ingestion: Arc<IngestionClient>,
    pub metrics: Arc<Metrics>,
    pub limits: BatchLimits,
    pub fingerprint_window: u64,
    pub mirror_checkpoints: bool,
    correlations: Mutex<HashMap<String, ToolCorrelation>>,
    parked: Mutex<HashMap<String, Option<FileStamp>>>,
}

impl PipelineContext {
    pub fn new(
        checkpoints: Arc<CheckpointStore>,
        ingestion: Arc<IngestionClient>,
        metrics: Arc<Metrics>,
        limits: BatchLimits,
        fingerprint_window: u64,
    ) -> Self {
        Self {
            checkpoints,
            ingestion,
            metrics,
            limits,
            fingerprint_window,
            mirror_checkpoints: true,
            correlations: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Forgets everything known about `path` in `scope` so its next cycle
    /// starts from offset 0. Returns whether a checkpoint was dropped.
    pub(crate) async fn rewind(&self, scope: &str, path: &str) -> SyncResult<bool> {
        self.take_correlation(scope, path);
        self.checkpoints.remove(scope, path).await
    }

    /// A parked file stays parked until its identity, size or timestamps
    /// move. Unparks and returns false once they did.
    fn still_parked(&self, scope: &str, path: &str) -> bool {
        let key = checkpoint_key(scope, path);
        let mut parked = self.parked.lock().expect("parked mutex poisoned");
        let Some(stamp) = parked.get(&key) else {
            return false;
        };
        if *stamp == FileStamp::read(path) {
            return true;
        }
        parked.remove(&key);
        false
    }

    fn park(&self, scope: &str, path: &str) {
        self.parked
            .lock()
            .expect("parked mutex poisoned")
            .insert(checkpoint_key(scope, path), FileStamp::read(path));
    }

    fn take_correlation(&self, scope: &str, path: &str) -> ToolCorrelation {
        self.correlations
            .lock()
            .expect("correlation mutex poisoned")
            .remove(&checkpoint_key(scope, path))
            .unwrap_or_default()
    }

    fn store_correlation(&self, scope: &str, path: &str, correlation: ToolCorrelation) {
        if correlation.is_empty() {
            return;
        }
        self.correlations
            .lock()
            .expect("correlation mutex poisoned")
            .insert(checkpoint_key(scope, path), correlation);
    }
}

/// What has to change before an unreadable file is tried again. The change
/// time covers permission fixes, which leave the modification time alone.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    id: FileId,
    len: u64,
    modified: Option<SystemTime>,
    changed: i64,
}

impl FileStamp {
    fn read(path: &str) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        #[cfg(unix)]
        let changed = {
            use std::os::unix::fs::MetadataExt;
            meta.ctime()
                .saturating_mul(1_000_000_000)
                .saturating_add(meta.ctime_nsec())
        };
        #[cfg(not(unix))]
        let changed = 0;
        Some(Self {
            id: FileId::from_metadata(path, &meta),
            len: meta.len(),
            modified: meta.modified().ok(),
            changed,
        })
    }
}

struct ActiveFile<'a>(&'a Metrics);

impl<'a> ActiveFile<'a> {
    fn enter(metrics: &'a Metrics) -> Self {
        metrics.files_active.fetch_add(1, Ordering::Relaxed);
        Self(metrics)
    }
}

impl Drop for ActiveFile<'_> {
    fn drop(&mut self) {
        self.0.files_active.fetch_sub(1, Ordering::Relaxed);
    }
}

fn is_not_found(err: &SyncError) -> bool {
    matches!(err, SyncError::FileAccess { source, .. } if source.kind() == ErrorKind::NotFound)
}

fn is_unreadable(err: &SyncError) -> bool {
    matches!(err, SyncError::FileAccess { .. })
}

/// Runs one tail cycle of `path` under `scope`: reads every complete line
/// appended since the committed checkpoint, ingests the derived rows and
/// advances the checkpoint behind them.
///
/// Checkpoints only move once every batch with rows from earlier lines was
/// written or dead-lettered. Cancellation stops at the next line or batch
/// boundary; whatever was committed stays committed.
///
/// In the live scope a file that cannot be read is treated as deleted: its
/// checkpoint is dropped and it is parked until it changes on disk.
pub async fn sync_file(
    ctx: &PipelineContext,
    scope: &str,
    path: &str,
    cancel: &CancellationToken,
) -> SyncResult<FileReport> {
    let mut report = FileReport::new(path);

    let Some(_lease) = ctx.checkpoints.try_lease(scope, path) else {
        debug!(scope, file = path, "file already leased; skipping");
        report.skipped = true;
        return Ok(report);
    };
    if ctx.still_parked(scope, path) {
        report.deleted = true;
        return Ok(report);
    }
    let _active = ActiveFile::enter(&ctx.metrics);

    match tail_file(ctx, scope, path, cancel, report).await {
        Err(exc) if scope == LIVE_SCOPE && is_unreadable(&exc) => {
            warn!(file = path, "file unreadable; parking it until it changes: {exc}");
            ctx.park(scope, path);
            forget_file(ctx, scope, path, FileReport::new(path)).await
        }
        other => other,
    }
}

async fn tail_file(
    ctx: &PipelineContext,
    scope: &str,
    path: &str,
    cancel: &CancellationToken,
    mut report: FileReport,
) -> SyncResult<FileReport> {
    let existing = ctx.checkpoints.get(scope, path).await;
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(exc) if exc.kind() == ErrorKind::NotFound => {
            return forget_file(ctx, scope, path, report).await;
        }
        Err(exc) => {
            ctx.metrics.file_access_errors.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::from_io(path, exc));
        }
    };

    let id = FileId::from_metadata(path, &meta);
    let change = match detect_change(&id, meta.len(), existing.as_ref(), ctx.fingerprint_window) {
        Ok(change) => change,
        Err(exc) if is_not_found(&exc) => return forget_file(ctx, scope, path, report).await,
        Err(exc) => return Err(exc),
    };

    let mut checkpoint = existing.unwrap_or_else(|| Checkpoint::initial(scope, &id));
    report.committed_offset = checkpoint.last_offset;
    report.generation = checkpoint.source_generation;

    let Some(change) = change else {
        return Ok(report);
    };

    let mut needs_commit = change == ChangeKind::Created;
    if change == ChangeKind::Truncated {
        info!(
            scope,
            file = path,
            previous_offset = checkpoint.last_offset,
            size = meta.len(),
            "file rotated or truncated; restarting from offset 0"
        );
        checkpoint.reset_for(&id);
        ctx.checkpoints.commit(checkpoint.clone()).await?;
        ctx.take_correlation(scope, path);
        report.reset = true;
        report.committed_offset = 0;
        report.generation = checkpoint.source_generation;
    }

    let tailer = match Tailer::open(path, checkpoint.last_offset, checkpoint.last_line_no) {
        Ok(tailer) => tailer,
        Err(exc) if is_not_found(&exc) => return forget_file(ctx, scope, path, report).await,
        Err(exc) => {
            ctx.metrics.file_access_errors.fetch_add(1, Ordering::Relaxed);
            return Err(exc);
        }
    };

    let mut cycle = Cycle {
        ctx,
        scope,
        path,
        cancel,
        processed_offset: checkpoint.last_offset,
        processed_line_no: checkpoint.last_line_no,
        checkpoint,
        assembler: BatchAssembler::new(ctx.limits),
        report,
    };
    let mut classifier = Classifier::with_correlation(ctx.take_correlation(scope, path));
    let outcome = cycle.run(tailer, &mut classifier, &mut needs_commit).await;
    ctx.store_correlation(scope, path, classifier.into_correlation());

    match outcome {
        Ok(()) => {}
        Err(SyncError::Cancelled) => cycle.report.cancelled = true,
        Err(exc) => {
            // keep whatever is already durable before surfacing the failure
            if let Err(commit_exc) = cycle.commit(true).await {
                warn!(file = path, "failed to commit progress after error: {commit_exc}");
            }
            return Err(exc);
        }
    }

    cycle.commit(needs_commit).await?;
    if cycle.report.cancelled {
        debug!(scope, file = path, offset = cycle.report.committed_offset, "tail cycle cancelled");
    } else {
        debug!(
            scope,
            file = path,
            lines = cycle.report.lines,
            rows = cycle.report.rows,
            offset = cycle.report.committed_offset,
            "tail cycle finished"
        );
    }
    Ok(cycle.report)
}

async fn forget_file(
    ctx: &PipelineContext,
    scope: &str,
    path: &str,
    mut report: FileReport,
) -> SyncResult<FileReport> {
    ctx.take_correlation(scope, path);
    if ctx.checkpoints.remove(scope, path).await? {
        info!(scope, file = path, "file gone or unreadable; checkpoint dropped");
    }
    report.deleted = true;
    Ok(report)
}

struct Cycle<'a> {
    ctx: &'a PipelineContext,
    scope: &'a str,
    path: &'a str,
    cancel: &'a CancellationToken,
    checkpoint: Checkpoint,
    assembler: BatchAssembler,
    processed_offset: u64,
    processed_line_no: u64,
    report: FileReport,
}

impl Cycle<'_> {
    async fn run(
        &mut self,
        mut tailer: Tailer,
        classifier: &mut Classifier,
        needs_commit: &mut bool,
    ) -> SyncResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let raw = match tailer.next() {
                Some(Ok(raw)) => raw,
                Some(Err(exc)) => {
                    self.ctx
                        .metrics
                        .file_access_errors
                        .fetch_add(1, Ordering::Relaxed);
                    self.ctx.metrics.record_error(exc.to_string());
                    self.processed(&tailer);
                    return Err(exc);
                }
                None => break,
            };

            self.report.lines += 1;
            self.ctx.metrics.lines_read.fetch_add(1, Ordering::Relaxed);

            let rows = match classifier.classify(&raw) {
                Ok(event) => {
                    self.report.records += 1;
                    self.report.tokens = self.report.tokens.saturating_add(event.usage().total());
                    classifier.rows(&event, &raw)
                }
                Err(SyncError::Parse { message, line_no, .. }) => {
                    debug!(file = self.path, line_no, "unparseable line: {message}");
                    self.report.parse_errors += 1;
                    self.ctx.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                    vec![error_row(&raw, "json_parse_error", &message)]
                }
                Err(exc) => return Err(exc),
            };
            self.processed(&tailer);

            let mut ready = Vec::new();
            for row in rows {
                ready.extend(self.assembler.push(row));
            }
            ready.extend(self.assembler.take_expired(Instant::now()));
            if !ready.is_empty() {
                self.ingest(ready).await?;
                self.commit(false).await?;
            }
        }

        self.processed(&tailer);
        let rest = self.assembler.flush_all();
        if !rest.is_empty() {
            self.ingest(rest).await?;
            *needs_commit = true;
        }
        if tailer.offset() != self.checkpoint.last_offset {
            *needs_commit = true;
        }
        Ok(())
    }

    fn processed(&mut self, tailer: &Tailer) {
        self.processed_offset = tailer.offset();
        self.processed_line_no = tailer.line_no();
    }

    async fn ingest(&mut self, batches: Vec<Batch>) -> SyncResult<()> {
        for batch in batches {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            self.report.batches += 1;
            match self.ctx.ingestion.ingest(&batch, self.cancel).await? {
                IngestOutcome::Written { .. } => self.report.rows += batch.len() as u64,
                IngestOutcome::DeadLettered { kind, .. } => {
                    self.report.dead_lettered_batches += 1;
                    if kind == IngestErrorKind::Permanent {
                        self.report.permanent_failures += 1;
                    }
                }
            }
            self.assembler.complete(&batch);
        }
        Ok(())
    }

    /// Moves the checkpoint to the safe watermark. With `force`, also writes
    /// an unchanged position (first sighting of a file).
    async fn commit(&mut self, force: bool) -> SyncResult<()> {
        let (offset, line_no) = self
            .assembler
            .safe_watermark(self.processed_offset, self.processed_line_no);
        let moved = offset != self.checkpoint.last_offset;
        if !moved && !force {
            return Ok(());
        }

        let mut next = self.checkpoint.clone();
        next.last_offset = offset;
        next.last_line_no = line_no;
        next.fingerprint = window_fingerprint(self.path, offset, self.ctx.fingerprint_window)?;
        self.ctx.checkpoints.commit(next.clone()).await?;
        self.ctx
            .metrics
            .checkpoint_commits
            .fetch_add(1, Ordering::Relaxed);
        self.report.committed_offset = next.last_offset;
        self.report.generation = next.source_generation;
        self.checkpoint = next;

        if self.ctx.mirror_checkpoints && self.scope == LIVE_SCOPE {
            self.mirror().await;
        }
        Ok(())
    }

    async fn mirror(&self) {
        let cp = &self.checkpoint;
        let row = json!({
            "scope": cp.scope,
            "source_file": cp.source_file,
            "source_device": cp.source_device,
            "source_inode": cp.source_inode,
            "source_generation": cp.source_generation,
            "last_offset": cp.last_offset,
            "last_line_no": cp.last_line_no,
            "fingerprint": cp.fingerprint,
        });
        if let Err(exc) = self
            .ctx
            .ingestion
            .store()
            .insert_rows(Table::IngestCheckpoints, &[row], "")
            .await
        {
            warn!(file = %cp.source_file, "checkpoint mirror insert failed: {exc}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::migration_scope;
    use crate::dead_letter::DeadLetterQueue;
    use crate::ingest::BackoffPolicy;
    use crate::store::MemoryEventStore;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "esker-pipeline-{label}-{}-{}",
            std::process::id(),
            unique
        ));
        std::fs::create_dir_all(&dir).expect("create temp root");
        dir
    }

    fn context() -> PipelineContext {
        let metrics = Arc::new(Metrics::default());
        let ingestion = Arc::new(IngestionClient::new(
            Arc::new(MemoryEventStore::new()),
            BackoffPolicy::default(),
            Duration::from_secs(1),
            Arc::new(DeadLetterQueue::in_memory()),
            metrics.clone(),
        ));
        PipelineContext::new(
            Arc::new(CheckpointStore::in_memory()),
            ingestion,
            metrics,
            BatchLimits {
                max_rows: 100,
                max_bytes: 1 << 20,
                max_wait: Duration::from_secs(60),
                hard_cap_bytes: 1 << 22,
            },
            1024,
        )
    }

    /// A directory at a log path opens fine but fails on the first read.
    fn unreadable_at(path: &Path) {
        std::fs::create_dir_all(path).expect("dir in place of log");
        std::fs::write(path.join("entry"), b"x").expect("dir entry");
    }

    fn user_line() -> String {
        let line = json!({
            "type": "user",
            "sessionId": "sess-1",
            "uuid": "u-1",
            "timestamp": "2026-02-03T10:00:00.000Z",
            "message": {"role": "user", "content": "hello"}
        });
        format!("{line}\n")
    }

    #[tokio::test]
    async fn unreadable_live_file_is_parked_until_it_changes() {
        let root = temp_root("parked");
        let log = root.join("a.jsonl");
        unreadable_at(&log);
        let path = log.to_string_lossy().to_string();
        let ctx = context();
        let cancel = CancellationToken::new();

        let first = sync_file(&ctx, LIVE_SCOPE, &path, &cancel)
            .await
            .expect("read failure is absorbed");
        assert!(first.deleted);
        assert!(ctx.checkpoints.get(LIVE_SCOPE, &path).await.is_none());
        assert_eq!(ctx.metrics.file_access_errors.load(Ordering::Relaxed), 1);

        // unchanged on disk: not read again
        let again = sync_file(&ctx, LIVE_SCOPE, &path, &cancel)
            .await
            .expect("parked");
        assert!(again.deleted);
        assert_eq!(ctx.metrics.file_access_errors.load(Ordering::Relaxed), 1);

        std::fs::remove_dir_all(&log).expect("remove dir");
        let body = user_line();
        std::fs::write(&log, &body).expect("write log");

        let report = sync_file(&ctx, LIVE_SCOPE, &path, &cancel)
            .await
            .expect("readable again");
        assert!(!report.deleted);
        assert_eq!(report.records, 1);
        let cp = ctx.checkpoints.get(LIVE_SCOPE, &path).await.expect("cp");
        assert_eq!(cp.last_offset, body.len() as u64);
    }

    #[tokio::test]
    async fn unreadable_file_fails_a_run_scope_cycle() {
        let root = temp_root("run-scope");
        let log = root.join("a.jsonl");
        unreadable_at(&log);
        let path = log.to_string_lossy().to_string();
        let ctx = context();

        let err = sync_file(&ctx, &migration_scope("r1"), &path, &CancellationToken::new())
            .await
            .expect_err("run scopes report the failure");
        assert!(matches!(err, SyncError::FileAccess { .. }));
        assert!(!ctx.still_parked(&migration_scope("r1"), &path));
    }
}
