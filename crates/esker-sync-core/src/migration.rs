use crate::checkpoint::migration_scope;
use crate::classify::format_event_ts;
use crate::discovery::Scanner;
use crate::error::{SyncError, SyncResult};
use crate::model::Table;
use crate::pipeline::{sync_file, FileReport, PipelineContext};
use crate::validate::{ValidationReport, Validator};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Idle,
    Discovering,
    Processing,
    Validating,
    Completed,
    Failed,
    Paused,
}

impl MigrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Processing => "processing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    /// A run in this state is not being driven and may be resumed.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Paused | Self::Failed)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    pub status: FileStatus,
    pub records: u64,
    pub rows: u64,
    pub tokens: u64,
    pub error: Option<String>,
}

impl Default for FileProgress {
    fn default() -> Self {
        Self {
            status: FileStatus::Pending,
            records: 0,
            rows: 0,
            tokens: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: String,
    pub root: String,
    pub status: MigrationStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub files: BTreeMap<String, FileProgress>,
    pub files_done: u64,
    pub files_failed: u64,
    pub records_ingested: u64,
    pub tokens_seen: u64,
    pub errors: Vec<String>,
    pub validation: Option<ValidationReport>,
}

impl MigrationRun {
    pub fn new(id: &str, root: &str) -> Self {
        Self {
            id: id.to_string(),
            root: root.to_string(),
            status: MigrationStatus::Idle,
            started_at: Utc::now().to_rfc3339(),
            ended_at: None,
            files: BTreeMap::new(),
            files_done: 0,
            files_failed: 0,
            records_ingested: 0,
            tokens_seen: 0,
            errors: Vec::new(),
            validation: None,
        }
    }

    pub fn files_total(&self) -> u64 {
        self.files.len() as u64
    }

    pub fn failed_files(&self) -> Vec<(&str, &str)> {
        self.files
            .iter()
            .filter(|(_, p)| p.status == FileStatus::Failed)
            .map(|(path, p)| (path.as_str(), p.error.as_deref().unwrap_or("")))
            .collect()
    }

    fn recount(&mut self) {
        self.files_done = 0;
        self.files_failed = 0;
        self.records_ingested = 0;
        self.tokens_seen = 0;
        for progress in self.files.values() {
            match progress.status {
                FileStatus::Completed => self.files_done += 1,
                FileStatus::Failed => self.files_failed += 1,
                _ => {}
            }
            self.records_ingested += progress.records;
            self.tokens_seen += progress.tokens;
        }
    }

    fn all_terminal(&self) -> bool {
        self.files.values().all(|p| p.status.is_terminal())
    }
}

enum FileOutcome {
    Done(FileReport),
    Failed(FileReport, String),
    Interrupted(FileReport),
    Pause(String),
}

fn judge(result: SyncResult<FileReport>) -> FileOutcome {
    match result {
        Ok(report) if report.cancelled || report.skipped => FileOutcome::Interrupted(report),
        Ok(report) if report.deleted => {
            FileOutcome::Failed(report, "file disappeared during migration".to_string())
        }
        Ok(report) if report.all_rejected() => {
            let message = format!(
                "all {} batches were permanently rejected by the store",
                report.batches
            );
            FileOutcome::Failed(report, message)
        }
        Ok(report) => FileOutcome::Done(report),
        Err(SyncError::Cancelled) => FileOutcome::Interrupted(FileReport::default()),
        Err(exc) if exc.is_resource() => FileOutcome::Pause(exc.to_string()),
        Err(exc) => FileOutcome::Failed(FileReport::default(), exc.to_string()),
    }
}

/// Drives a backfill run: every file under the root goes through the live
/// tail cycle with the run's own checkpoint scope. A resumed run skips
/// completed files and restarts every other file from offset 0.
pub struct MigrationController {
    ctx: Arc<PipelineContext>,
    file_glob: String,
    max_workers: usize,
    validator: Option<Validator>,
}

impl MigrationController {
    pub fn new(
        ctx: Arc<PipelineContext>,
        file_glob: &str,
        max_workers: usize,
        validator: Option<Validator>,
    ) -> Self {
        Self {
            ctx,
            file_glob: file_glob.to_string(),
            max_workers: max_workers.max(1),
            validator,
        }
    }

    async fn save(&self, run: &MigrationRun) -> SyncResult<()> {
        self.ctx.checkpoints.save_run(run).await
    }

    async fn transition(&self, run: &mut MigrationRun, status: MigrationStatus) -> SyncResult<()> {
        info!(run_id = %run.id, from = %run.status, to = %status, "migration transition");
        run.status = status;
        if matches!(status, MigrationStatus::Completed | MigrationStatus::Failed) {
            run.ended_at = Some(Utc::now().to_rfc3339());
        }
        self.save(run).await?;
        self.log_run(run).await;
        Ok(())
    }

    async fn log_run(&self, run: &MigrationRun) {
        let row = json!({
            "run_id": run.id,
            "status": run.status.as_str(),
            "files_total": run.files_total().min(u32::MAX as u64),
            "files_done": run.files_done.min(u32::MAX as u64),
            "files_failed": run.files_failed.min(u32::MAX as u64),
            "records_ingested": run.records_ingested,
            "tokens_seen": run.tokens_seen,
            "error_count": run.errors.len().min(u32::MAX as usize),
            "started_at": format_event_ts(&run.started_at),
        });
        if let Err(exc) = self
            .ctx
            .ingestion
            .store()
            .insert_rows(Table::MigrationLog, &[row], "")
            .await
        {
            warn!(run_id = %run.id, "migration_log insert failed: {exc}");
        }
    }

    /// Runs (or resumes) `run` until it completes, fails, or pauses. The run
    /// record is saved after every state or file transition. A validation
    /// divergence fails the run and is returned as an error.
    pub async fn run(
        &self,
        run: &mut MigrationRun,
        cancel: &CancellationToken,
    ) -> SyncResult<MigrationStatus> {
        match run.status {
            MigrationStatus::Idle | MigrationStatus::Discovering => self.discover(run).await?,
            // stopped before any file was found
            status if status.is_resumable() && run.files.is_empty() => {
                run.ended_at = None;
                self.discover(run).await?;
            }
            status if status.is_resumable() => {
                self.rewind_unfinished(run, |file| file != FileStatus::Completed)
                    .await?;
                run.ended_at = None;
                run.validation = None;
                run.recount();
                info!(run_id = %run.id, from = %status, "resuming migration");
            }
            MigrationStatus::Processing | MigrationStatus::Validating => {
                // interrupted by a crash
                self.rewind_unfinished(run, |file| !file.is_terminal())
                    .await?;
                run.recount();
            }
            MigrationStatus::Completed => return Ok(MigrationStatus::Completed),
            _ => {}
        }

        self.transition(run, MigrationStatus::Processing).await?;
        if let Some(reason) = self.process(run, cancel).await? {
            run.errors.push(reason);
        }

        if !run.all_terminal() {
            self.transition(run, MigrationStatus::Paused).await?;
            return Ok(MigrationStatus::Paused);
        }

        self.transition(run, MigrationStatus::Validating).await?;
        let validation = match &self.validator {
            Some(validator) => {
                let files: Vec<String> = run.files.keys().cloned().collect();
                match validator
                    .measure(&files, self.ctx.ingestion.store().as_ref(), &run.root)
                    .await
                {
                    Ok(report) => Some(report),
                    Err(exc) => {
                        // store unreachable: stay resumable instead of failing
                        warn!(run_id = %run.id, "validation could not run: {exc}");
                        run.errors.push(format!("validation: {exc}"));
                        self.transition(run, MigrationStatus::Paused).await?;
                        return Ok(MigrationStatus::Paused);
                    }
                }
            }
            None => None,
        };
        run.validation = validation.clone();

        let breakdown: Vec<String> = run
            .failed_files()
            .into_iter()
            .map(|(path, message)| format!("{path}: {message}"))
            .collect();
        for line in breakdown {
            if !run.errors.contains(&line) {
                run.errors.push(line);
            }
        }

        let diverged = validation.filter(|report| !report.within_tolerance);
        let status = if run.files_failed == 0 && diverged.is_none() {
            MigrationStatus::Completed
        } else {
            MigrationStatus::Failed
        };
        if let Some(report) = &diverged {
            run.errors.push(format!(
                "validation: store total {} vs source total {} (variance {:.6})",
                report.store_tokens, report.source_tokens, report.variance
            ));
        }
        self.transition(run, status).await?;

        match diverged {
            Some(report) => report.into_result().map(|_| status),
            None => Ok(status),
        }
    }

    async fn discover(&self, run: &mut MigrationRun) -> SyncResult<()> {
        self.transition(run, MigrationStatus::Discovering).await?;
        let discovered = Scanner::new(
            Path::new(&run.root),
            &self.file_glob,
            self.ctx.fingerprint_window,
        )
        .and_then(|scanner| scanner.enumerate());
        let paths = match discovered {
            Ok(paths) => paths,
            Err(exc @ SyncError::Config(_)) => {
                run.errors.push(format!("discovery: {exc}"));
                self.transition(run, MigrationStatus::Failed).await?;
                return Err(exc);
            }
            Err(exc) => return Err(exc),
        };
        for path in paths {
            run.files.entry(path).or_default();
        }
        info!(run_id = %run.id, files = run.files.len(), root = %run.root, "migration discovered files");
        self.save(run).await
    }

    /// Sends every file matching `restart` back to Pending with zeroed counts
    /// and drops its run checkpoint, so the next pass reads it from offset 0.
    /// Rows ingested before the interruption carry the same dedup keys and
    /// collapse in the store.
    async fn rewind_unfinished(
        &self,
        run: &mut MigrationRun,
        restart: impl Fn(FileStatus) -> bool,
    ) -> SyncResult<()> {
        let scope = migration_scope(&run.id);
        for (path, progress) in run.files.iter_mut() {
            if !restart(progress.status) {
                continue;
            }
            *progress = FileProgress::default();
            if self.ctx.rewind(&scope, path).await? {
                debug!(run_id = %run.id, file = %path, "restarting partially read file");
            }
        }
        Ok(())
    }

    /// Processes every pending file. Returns the reason when the run must
    /// pause before all files are terminal.
    async fn process(
        &self,
        run: &mut MigrationRun,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<String>> {
        let scope = migration_scope(&run.id);
        let run_cancel = cancel.child_token();
        let mut queue: VecDeque<String> = run
            .files
            .iter()
            .filter(|(_, p)| p.status == FileStatus::Pending)
            .map(|(path, _)| path.clone())
            .collect();
        let mut workers = JoinSet::new();
        let mut pause_reason = None;

        loop {
            while workers.len() < self.max_workers && !run_cancel.is_cancelled() {
                let Some(path) = queue.pop_front() else {
                    break;
                };
                if let Some(progress) = run.files.get_mut(&path) {
                    progress.status = FileStatus::InProgress;
                }
                self.save(run).await?;

                let ctx = self.ctx.clone();
                let scope = scope.clone();
                let cancel = run_cancel.clone();
                workers.spawn(async move {
                    let result = sync_file(&ctx, &scope, &path, &cancel).await;
                    (path, result)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let (path, result) = match joined {
                Ok(done) => done,
                Err(exc) => {
                    error!(run_id = %run.id, "migration worker panicked: {exc}");
                    pause_reason.get_or_insert_with(|| format!("worker failure: {exc}"));
                    run_cancel.cancel();
                    continue;
                }
            };

            let Some(progress) = run.files.get_mut(&path) else {
                continue;
            };
            match judge(result) {
                FileOutcome::Done(report) => {
                    absorb(progress, &report);
                    progress.status = FileStatus::Completed;
                    info!(
                        run_id = %run.id,
                        file = %path,
                        records = report.records,
                        offset = report.committed_offset,
                        "migration file completed"
                    );
                }
                FileOutcome::Failed(report, message) => {
                    absorb(progress, &report);
                    warn!(run_id = %run.id, file = %path, "migration file failed: {message}");
                    progress.status = FileStatus::Failed;
                    progress.error = Some(message);
                }
                FileOutcome::Interrupted(report) => {
                    // partial counts are dropped; resuming rewinds the file
                    debug!(
                        run_id = %run.id,
                        file = %path,
                        offset = report.committed_offset,
                        "migration file interrupted"
                    );
                    progress.status = FileStatus::Pending;
                    pause_reason.get_or_insert_with(|| "cancelled".to_string());
                    run_cancel.cancel();
                }
                FileOutcome::Pause(message) => {
                    warn!(run_id = %run.id, file = %path, "pausing migration: {message}");
                    progress.status = FileStatus::Pending;
                    pause_reason.get_or_insert(message);
                    run_cancel.cancel();
                }
            }
            run.recount();
            self.save(run).await?;
        }

        if cancel.is_cancelled() && pause_reason.is_none() && !run.all_terminal() {
            pause_reason = Some("cancelled".to_string());
        }
        Ok(pause_reason)
    }
}

fn absorb(progress: &mut FileProgress, report: &FileReport) {
    progress.records += report.records;
    progress.rows += report.rows;
    progress.tokens += report.tokens;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recount_sums_file_progress() {
        let mut run = MigrationRun::new("r1", "/logs");
        run.files.insert(
            "/logs/a.jsonl".to_string(),
            FileProgress {
                status: FileStatus::Completed,
                records: 3,
                rows: 4,
                tokens: 100,
                error: None,
            },
        );
        run.files.insert(
            "/logs/b.jsonl".to_string(),
            FileProgress {
                status: FileStatus::Failed,
                error: Some("unreadable".to_string()),
                ..FileProgress::default()
            },
        );
        run.files
            .insert("/logs/c.jsonl".to_string(), FileProgress::default());

        run.recount();
        assert_eq!(run.files_done, 1);
        assert_eq!(run.files_failed, 1);
        assert_eq!(run.records_ingested, 3);
        assert_eq!(run.tokens_seen, 100);
        assert!(!run.all_terminal());
        assert_eq!(run.failed_files(), vec![("/logs/b.jsonl", "unreadable")]);
    }

    #[test]
    fn judge_maps_errors_to_file_outcomes() {
        let deleted = FileReport {
            deleted: true,
            ..FileReport::default()
        };
        assert!(matches!(judge(Ok(deleted)), FileOutcome::Failed(..)));

        let rejected = FileReport {
            batches: 2,
            permanent_failures: 2,
            ..FileReport::default()
        };
        assert!(matches!(judge(Ok(rejected)), FileOutcome::Failed(..)));

        let partial = FileReport {
            batches: 2,
            permanent_failures: 1,
            ..FileReport::default()
        };
        assert!(matches!(judge(Ok(partial)), FileOutcome::Done(..)));

        assert!(matches!(
            judge(Err(SyncError::Resource("disk full".to_string()))),
            FileOutcome::Pause(_)
        ));
        assert!(matches!(
            judge(Err(SyncError::Cancelled)),
            FileOutcome::Interrupted(_)
        ));
        assert!(matches!(
            judge(Err(SyncError::Checkpoint("io".to_string()))),
            FileOutcome::Failed(..)
        ));
    }

    #[test]
    fn status_round_trips_through_json() {
        let mut run = MigrationRun::new("r2", "/logs");
        run.status = MigrationStatus::Paused;
        let text = serde_json::to_string(&run).expect("encode");
        assert!(text.contains("\"paused\""));
        let back: MigrationRun = serde_json::from_str(&text).expect("decode");
        assert_eq!(back, run);
        assert!(back.status.is_resumable());
    }
}
