use crate::batch::BatchLimits;
use crate::checkpoint::{CheckpointStore, LIVE_SCOPE};
use crate::dead_letter::DeadLetterQueue;
use crate::discovery::{ChangeKind, ChangeStream, Scanner};
use crate::dispatch::{enqueue_work, spawn_worker_pool, DispatchState, WorkItem};
use crate::error::{SyncError, SyncResult};
use crate::heartbeat::spawn_heartbeat_task;
use crate::ingest::{BackoffPolicy, IngestionClient};
use crate::metrics::{build_status, Metrics, SyncStatus};
use crate::migration::{MigrationController, MigrationRun, MigrationStatus};
use crate::pipeline::{sync_file, FileReport, PipelineContext};
use crate::store::{ClickHouseEventStore, EventStore};
use crate::validate::Validator;
use anyhow::{Context, Result};
use esker_clickhouse::ClickHouseClient;
use esker_config::{expand_path, AppConfig, WatchMode};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const WORK_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub kind: String,
    pub error: String,
}

/// Result of one full pass over a root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub root: String,
    pub files_changed: usize,
    pub files_deleted: usize,
    pub files_reset: usize,
    pub lines: u64,
    pub records: u64,
    pub rows: u64,
    pub parse_errors: u64,
    pub tokens: u64,
    pub dead_lettered_batches: u64,
    pub files: Vec<FileReport>,
    pub failures: Vec<FileFailure>,
}

impl CycleReport {
    fn absorb(&mut self, report: FileReport) {
        if report.deleted {
            self.files_deleted += 1;
        }
        if report.reset {
            self.files_reset += 1;
        }
        self.lines += report.lines;
        self.records += report.records;
        self.rows += report.rows;
        self.parse_errors += report.parse_errors;
        self.tokens += report.tokens;
        self.dead_lettered_batches += report.dead_lettered_batches;
        self.files.push(report);
    }
}

/// A running live sync. Dropping the handle does not stop it; call
/// [`SyncHandle::shutdown`].
pub struct SyncHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops watching, lets in-flight tail cycles reach a line or batch
    /// boundary, and waits for every task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(exc) = task.await {
                error!("sync task ended abnormally: {exc}");
            }
        }
    }
}

struct MigrationTask {
    cancel: CancellationToken,
    finished: CancellationToken,
    handle: Option<JoinHandle<SyncResult<MigrationStatus>>>,
}

impl MigrationTask {
    fn is_running(&self) -> bool {
        !self.finished.is_cancelled()
    }
}

pub struct SyncEngine {
    config: AppConfig,
    checkpoints: Arc<CheckpointStore>,
    metrics: Arc<Metrics>,
    ctx: Arc<PipelineContext>,
    migrations: Mutex<HashMap<String, MigrationTask>>,
}

impl SyncEngine {
    /// Engine persisting checkpoints, runs and dead letters under
    /// `sync.state_dir`.
    pub fn new(config: AppConfig, store: Arc<dyn EventStore>) -> SyncResult<Self> {
        let state_dir = expand_path(&config.sync.state_dir);
        let state_dir = Path::new(&state_dir);
        let checkpoints = Arc::new(CheckpointStore::open(state_dir)?);
        let dead_letters = Arc::new(DeadLetterQueue::open(state_dir)?);
        Ok(Self::with_parts(config, store, checkpoints, dead_letters))
    }

    /// Engine writing to ClickHouse as configured in `[clickhouse]`.
    pub fn connect(config: AppConfig) -> Result<Self> {
        let client = ClickHouseClient::new(config.clickhouse.clone())?;
        let store: Arc<dyn EventStore> = Arc::new(ClickHouseEventStore::new(client));
        Self::new(config, store).context("failed to open sync state")
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn EventStore>,
        checkpoints: Arc<CheckpointStore>,
        dead_letters: Arc<DeadLetterQueue>,
    ) -> Self {
        let metrics = Arc::new(Metrics::default());
        let ingestion = Arc::new(IngestionClient::new(
            store,
            BackoffPolicy::from_config(&config.ingest),
            Duration::from_secs_f64(config.ingest.batch_timeout_seconds.max(0.001)),
            dead_letters,
            metrics.clone(),
        ));
        let ctx = Arc::new(PipelineContext::new(
            checkpoints.clone(),
            ingestion,
            metrics.clone(),
            BatchLimits::from_config(&config.sync),
            config.sync.fingerprint_window_bytes,
        ));

        Self {
            config,
            checkpoints,
            metrics,
            ctx,
            migrations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        self.ctx.ingestion.dead_letters()
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        self.ctx.ingestion.store()
    }

    fn scanner(&self, root: &str) -> SyncResult<Scanner> {
        Scanner::new(
            Path::new(&expand_path(root)),
            &self.config.sync.file_glob,
            self.config.sync.fingerprint_window_bytes,
        )
    }

    /// One synchronous pass over `root` in the live scope: every new,
    /// appended, rotated or deleted file is brought up to date.
    pub async fn run_once(&self, root: &str) -> SyncResult<CycleReport> {
        let scanner = self.scanner(root)?;
        let changes = scanner.scan(&self.checkpoints, LIVE_SCOPE).await?;
        let mut report = CycleReport {
            root: scanner.root().display().to_string(),
            files_changed: changes.len(),
            ..CycleReport::default()
        };

        let cancel = CancellationToken::new();
        let max_workers = self.config.sync.max_file_workers.max(1);
        let mut pending = changes.into_iter();
        let mut workers = JoinSet::new();
        let mut resource_error = None;

        loop {
            while workers.len() < max_workers && resource_error.is_none() {
                let Some(change) = pending.next() else {
                    break;
                };
                if change.kind == ChangeKind::Deleted {
                    info!(file = %change.file.id.path, "file deleted since last cycle");
                }
                let ctx = self.ctx.clone();
                let cancel = cancel.clone();
                let path = change.file.id.path;
                workers.spawn(async move {
                    let result = sync_file(&ctx, LIVE_SCOPE, &path, &cancel).await;
                    (path, result)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let (path, result) = match joined {
                Ok(done) => done,
                Err(exc) => {
                    error!("tail cycle task failed: {exc}");
                    continue;
                }
            };
            match result {
                Ok(file_report) => report.absorb(file_report),
                Err(exc) => {
                    warn!(file = %path, "tail cycle failed: {exc}");
                    self.metrics.record_error(exc.to_string());
                    report.failures.push(FileFailure {
                        path,
                        kind: exc.kind_label().to_string(),
                        error: exc.to_string(),
                    });
                    if exc.is_resource() {
                        // stop starting new files; running cycles finish
                        resource_error.get_or_insert(exc);
                    }
                }
            }
        }

        report.files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            root = %report.root,
            files = report.files_changed,
            rows = report.rows,
            failures = report.failures.len(),
            "sync cycle complete"
        );
        match resource_error {
            Some(exc) => Err(exc),
            None => Ok(report),
        }
    }

    /// Starts watching `root` and keeps the live scope in sync until the
    /// returned handle is shut down.
    pub fn start_incremental_sync(&self, root: &str, mode: WatchMode) -> SyncResult<SyncHandle> {
        let cancel = CancellationToken::new();
        let scanner = self.scanner(root)?;
        info!(root = %scanner.root().display(), ?mode, "starting incremental sync");
        let mut stream = ChangeStream::open(
            scanner,
            mode,
            &self.config.sync,
            self.checkpoints.clone(),
            LIVE_SCOPE,
            self.metrics.clone(),
            cancel.clone(),
        )?;

        let (process_tx, process_rx) = mpsc::channel::<WorkItem>(WORK_QUEUE_CAPACITY);
        let dispatch = Arc::new(Mutex::new(DispatchState::default()));

        let pool = spawn_worker_pool(
            self.ctx.clone(),
            process_rx,
            process_tx.clone(),
            dispatch.clone(),
            self.config.sync.max_file_workers,
            cancel.clone(),
        );
        let heartbeat = spawn_heartbeat_task(
            self.store().clone(),
            self.checkpoints.clone(),
            self.metrics.clone(),
            Duration::from_secs_f64(self.config.sync.heartbeat_interval_seconds.max(0.1)),
            cancel.clone(),
        );

        let metrics = self.metrics.clone();
        let feeder = tokio::spawn(async move {
            while let Some(change) = stream.next().await {
                let work = WorkItem {
                    scope: LIVE_SCOPE.to_string(),
                    path: change.file.id.path,
                };
                enqueue_work(work, &process_tx, &dispatch, &metrics).await;
            }
        });

        Ok(SyncHandle {
            cancel,
            tasks: vec![feeder, pool, heartbeat],
        })
    }

    fn migration_controller(&self) -> MigrationController {
        let validator = self
            .config
            .migration
            .validate_on_complete
            .then(|| Validator::new(self.config.validation.tolerance));
        MigrationController::new(
            self.ctx.clone(),
            &self.config.sync.file_glob,
            self.config.migration.max_file_workers,
            validator,
        )
    }

    fn spawn_migration(&self, mut run: MigrationRun) {
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let controller = self.migration_controller();
        let run_id = run.id.clone();
        let task_cancel = cancel.clone();
        let done = finished.clone().drop_guard();
        let handle = tokio::spawn(async move {
            let _done = done;
            let result = controller.run(&mut run, &task_cancel).await;
            match &result {
                Ok(status) => info!(run_id = %run.id, %status, "migration run stopped"),
                Err(exc) => error!(run_id = %run.id, "migration run failed: {exc}"),
            }
            result
        });

        let mut migrations = self.migrations.lock().expect("migration mutex poisoned");
        migrations.insert(
            run_id,
            MigrationTask {
                cancel,
                finished,
                handle: Some(handle),
            },
        );
    }

    fn is_running(&self, run_id: &str) -> bool {
        self.migrations
            .lock()
            .expect("migration mutex poisoned")
            .get(run_id)
            .is_some_and(MigrationTask::is_running)
    }

    /// Creates a backfill run over `root` and starts it in the background.
    pub async fn start_historical_migration(&self, root: &str) -> SyncResult<String> {
        let id = Uuid::new_v4().to_string();
        let run = MigrationRun::new(&id, &expand_path(root));
        self.checkpoints.save_run(&run).await?;
        info!(run_id = %id, root = %run.root, "starting historical migration");
        self.spawn_migration(run);
        Ok(id)
    }

    /// Continues a paused, failed or interrupted run from its first file that
    /// has not completed. A run that is already running is left alone.
    pub async fn resume_migration(&self, run_id: &str) -> SyncResult<()> {
        if self.is_running(run_id) {
            info!(run_id, "migration already running");
            return Ok(());
        }
        let run = self
            .checkpoints
            .load_run(run_id)
            .await
            .ok_or_else(|| SyncError::UnknownRun(run_id.to_string()))?;
        if run.status == MigrationStatus::Completed {
            info!(run_id, "migration already completed; nothing to resume");
            return Ok(());
        }
        self.spawn_migration(run);
        Ok(())
    }

    /// Asks a running migration to stop at the next line or batch boundary.
    /// Returns whether a running task was signalled.
    pub async fn pause_migration(&self, run_id: &str) -> SyncResult<bool> {
        let signalled = {
            let migrations = self.migrations.lock().expect("migration mutex poisoned");
            match migrations.get(run_id) {
                Some(task) if task.is_running() => {
                    task.cancel.cancel();
                    true
                }
                _ => false,
            }
        };
        if !signalled && self.checkpoints.load_run(run_id).await.is_none() {
            return Err(SyncError::UnknownRun(run_id.to_string()));
        }
        if signalled {
            info!(run_id, "pause requested");
        }
        Ok(signalled)
    }

    /// Waits for the background task of `run_id` and returns the saved run.
    /// A validation divergence is returned as an error.
    pub async fn wait_migration(&self, run_id: &str) -> SyncResult<MigrationRun> {
        let (handle, finished) = {
            let mut migrations = self.migrations.lock().expect("migration mutex poisoned");
            match migrations.get_mut(run_id) {
                Some(task) => (task.handle.take(), Some(task.finished.clone())),
                None => (None, None),
            }
        };

        match (handle, finished) {
            (Some(handle), _) => {
                let joined = handle.await;
                self.migrations
                    .lock()
                    .expect("migration mutex poisoned")
                    .remove(run_id);
                match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(exc)) => return Err(exc),
                    Err(exc) => error!(run_id, "migration task ended abnormally: {exc}"),
                }
            }
            // another caller owns the join handle
            (None, Some(finished)) => finished.cancelled().await,
            (None, None) => {}
        }

        self.get_migration_status(run_id)
            .await
            .ok_or_else(|| SyncError::UnknownRun(run_id.to_string()))
    }

    pub async fn get_migration_status(&self, run_id: &str) -> Option<MigrationRun> {
        self.checkpoints.load_run(run_id).await
    }

    pub async fn migration_runs(&self) -> Vec<MigrationRun> {
        self.checkpoints.runs().await
    }

    pub async fn get_sync_status(&self) -> SyncStatus {
        let checkpoints = self.checkpoints.scope_entries(LIVE_SCOPE).await;
        build_status(&checkpoints, &self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use esker_config::default_config;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "esker-engine-{label}-{}-{}",
            std::process::id(),
            unique
        ));
        std::fs::create_dir_all(&dir).expect("create temp root");
        dir
    }

    fn engine(state: &Path) -> SyncEngine {
        let mut config = default_config();
        config.sync.state_dir = state.to_string_lossy().to_string();
        SyncEngine::new(config, Arc::new(MemoryEventStore::new())).expect("engine")
    }

    #[tokio::test]
    async fn run_once_on_empty_root_reports_nothing() {
        let root = temp_root("empty");
        let engine = engine(&root.join("state"));
        let report = engine
            .run_once(&root.to_string_lossy())
            .await
            .expect("cycle");
        assert_eq!(report.files_changed, 0);
        assert!(report.failures.is_empty());
        assert_eq!(engine.get_sync_status().await.files_tracked, 0);
    }

    #[tokio::test]
    async fn unknown_runs_are_reported() {
        let root = temp_root("unknown");
        let engine = engine(&root.join("state"));
        assert!(engine.get_migration_status("nope").await.is_none());
        assert!(matches!(
            engine.resume_migration("nope").await,
            Err(SyncError::UnknownRun(_))
        ));
        assert!(matches!(
            engine.pause_migration("nope").await,
            Err(SyncError::UnknownRun(_))
        ));
    }
}
