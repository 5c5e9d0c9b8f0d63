use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use esker_config::{default_config, AppConfig};
use esker_sync_core::model::Table;
use esker_sync_core::{
    EventStore, FileStatus, IngestErrorKind, MemoryEventStore, MigrationStatus, SyncEngine,
    SyncError,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

fn temp_root(label: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "esker-migration-{label}-{}-{}",
        std::process::id(),
        unique
    ));
    std::fs::create_dir_all(&dir).expect("create temp root");
    dir
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn migration_config(state_dir: &Path) -> AppConfig {
    let mut config = default_config();
    config.sync.state_dir = path_str(state_dir);
    config.sync.batch_max_wait_ms = 60_000;
    config.ingest.batch_timeout_seconds = 0.3;
    config.ingest.retry_base_delay_ms = 5;
    config.ingest.retry_max_delay_ms = 20;
    config.migration.max_file_workers = 1;
    config.migration.validate_on_complete = true;
    config.validation.tolerance = 0.0;
    config
}

/// Ten session files; file `i` carries `11 * i` tokens.
fn write_history(logs: &Path) -> u64 {
    std::fs::create_dir_all(logs).expect("logs dir");
    let mut expected = 0;
    for i in 1..=10u64 {
        let lines = [
            json!({
                "type": "user",
                "sessionId": format!("sess-{i:02}"),
                "uuid": format!("u-{i}"),
                "timestamp": "2026-01-05T08:00:00.000Z",
                "message": {"role": "user", "content": format!("question {i}")}
            }),
            json!({
                "type": "assistant",
                "sessionId": format!("sess-{i:02}"),
                "uuid": format!("a-{i}"),
                "timestamp": "2026-01-05T08:00:02.000Z",
                "message": {
                    "role": "assistant",
                    "model": "claude-opus-4-5",
                    "usage": {"input_tokens": i * 10, "output_tokens": i},
                    "content": [{"type": "text", "text": format!("answer {i}")}]
                }
            }),
        ];
        let body: String = lines.iter().map(|line| format!("{line}\n")).collect();
        std::fs::write(logs.join(format!("file-{i:02}.jsonl")), body).expect("write history");
        expected += i * 11;
    }
    expected
}

fn source_files(rows: &[Value]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row["source_file"].as_str())
        .map(str::to_string)
        .collect()
}

/// Records which files reach the store; while `hold` is set, message inserts
/// from a file containing it, or carrying it as message id, never complete.
struct GateStore {
    inner: Arc<MemoryEventStore>,
    hold: Option<String>,
    reached: Notify,
    held: AtomicBool,
    written: Mutex<Vec<String>>,
}

impl GateStore {
    fn new(inner: Arc<MemoryEventStore>, hold: Option<&str>) -> Self {
        Self {
            inner,
            hold: hold.map(str::to_string),
            reached: Notify::new(),
            held: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
        }
    }

    fn written_files(&self) -> Vec<String> {
        self.written.lock().expect("written lock").clone()
    }
}

#[async_trait]
impl EventStore for GateStore {
    async fn insert_rows(&self, table: Table, rows: &[Value], dedup_token: &str) -> Result<()> {
        if table == Table::Messages {
            let files = source_files(rows);
            if let Some(hold) = &self.hold {
                let held_file = files.iter().any(|file| file.contains(hold.as_str()));
                let held_message = rows
                    .iter()
                    .any(|row| row["message_id"].as_str() == Some(hold.as_str()));
                if held_file || held_message {
                    if !self.held.swap(true, Ordering::SeqCst) {
                        self.reached.notify_one();
                    }
                    std::future::pending::<()>().await;
                }
            }
            self.written.lock().expect("written lock").extend(files);
        }
        self.inner.insert_rows(table, rows, dedup_token).await
    }

    async fn total_tokens(&self, source_prefix: &str) -> Result<u64> {
        self.inner.total_tokens(source_prefix).await
    }

    async fn row_count(&self, table: Table) -> Result<u64> {
        self.inner.row_count(table).await
    }
}

/// Accepts message rows from a file containing `needle` without storing
/// them, or rejects them as permanently unwritable.
struct LossyStore {
    inner: Arc<MemoryEventStore>,
    needle: String,
    reject: bool,
}

#[async_trait]
impl EventStore for LossyStore {
    async fn insert_rows(&self, table: Table, rows: &[Value], dedup_token: &str) -> Result<()> {
        let hit = table == Table::Messages
            && source_files(rows)
                .iter()
                .any(|file| file.contains(&self.needle));
        if hit && self.reject {
            return Err(anyhow::Error::new(SyncError::Ingestion {
                table: table.name().to_string(),
                kind: IngestErrorKind::Permanent,
                message: "Type mismatch in column total_tokens".to_string(),
            }));
        }
        if hit {
            return Ok(());
        }
        self.inner.insert_rows(table, rows, dedup_token).await
    }

    async fn total_tokens(&self, source_prefix: &str) -> Result<u64> {
        self.inner.total_tokens(source_prefix).await
    }

    async fn row_count(&self, table: Table) -> Result<u64> {
        self.inner.row_count(table).await
    }
}

#[tokio::test]
async fn uninterrupted_run_completes_and_validates() {
    let root = temp_root("clean");
    let logs = root.join("logs");
    let expected = write_history(&logs);

    let store = Arc::new(MemoryEventStore::new());
    let engine =
        SyncEngine::new(migration_config(&root.join("state")), store.clone()).expect("engine");
    let id = engine
        .start_historical_migration(&path_str(&logs))
        .await
        .expect("start");
    let run = engine.wait_migration(&id).await.expect("completed run");

    assert_eq!(run.status, MigrationStatus::Completed);
    assert_eq!(run.files_done, 10);
    assert_eq!(run.tokens_seen, expected);
    assert!(run.ended_at.is_some());
    let report = run.validation.expect("validation report");
    assert_eq!(report.source_tokens, expected);
    assert_eq!(report.store_tokens, expected);
    assert!(report.within_tolerance);

    let log = store.rows(Table::MigrationLog);
    assert!(log.iter().any(|row| row["status"] == "completed"));
    // live offsets are untouched by a backfill
    assert_eq!(engine.get_sync_status().await.files_tracked, 0);
}

#[tokio::test]
async fn interrupted_run_resumes_at_the_first_unfinished_file() {
    let root = temp_root("resume");
    let logs = root.join("logs");
    let state = root.join("state");
    let expected = write_history(&logs);
    let store = Arc::new(MemoryEventStore::new());

    let gate = Arc::new(GateStore::new(store.clone(), Some("file-06")));
    let engine = SyncEngine::new(migration_config(&state), gate.clone()).expect("engine");
    let id = engine
        .start_historical_migration(&path_str(&logs))
        .await
        .expect("start");

    tokio::time::timeout(Duration::from_secs(10), gate.reached.notified())
        .await
        .expect("migration reached file-06");
    assert!(engine.pause_migration(&id).await.expect("pause"));
    let paused = engine.wait_migration(&id).await.expect("paused run");

    assert_eq!(paused.status, MigrationStatus::Paused);
    assert_eq!(paused.files_done, 5);
    assert_eq!(paused.tokens_seen, (1..=5u64).map(|i| i * 11).sum::<u64>());
    let statuses: Vec<FileStatus> = paused.files.values().map(|p| p.status).collect();
    assert_eq!(&statuses[..5], &[FileStatus::Completed; 5]);
    assert!(statuses[5..].iter().all(|s| *s == FileStatus::Pending));
    drop(engine);

    // a fresh process picks the run up from the state directory
    let recorder = Arc::new(GateStore::new(store.clone(), None));
    let engine = SyncEngine::new(migration_config(&state), recorder.clone()).expect("engine");
    assert_eq!(
        engine.get_migration_status(&id).await.map(|run| run.status),
        Some(MigrationStatus::Paused)
    );
    engine.resume_migration(&id).await.expect("resume");
    let run = engine.wait_migration(&id).await.expect("completed run");

    assert_eq!(run.status, MigrationStatus::Completed);
    assert_eq!(run.files_done, 10);
    assert_eq!(run.tokens_seen, expected);
    let report = run.validation.expect("validation report");
    assert_eq!(report.store_tokens, expected);
    assert_eq!(report.source_tokens, expected);

    let rewritten = recorder.written_files();
    assert!(rewritten.iter().all(|file| {
        ["file-06", "file-07", "file-08", "file-09", "file-10"]
            .iter()
            .any(|name| file.contains(name))
    }));
    assert_eq!(
        store.total_tokens(&format!("{}/", path_str(&logs))).await.expect("total"),
        expected
    );
}

#[tokio::test]
async fn file_paused_mid_way_is_counted_in_full_after_resume() {
    let root = temp_root("midfile");
    let logs = root.join("logs");
    let state = root.join("state");
    std::fs::create_dir_all(&logs).expect("logs dir");
    let body: String = (1..=4)
        .map(|i| {
            let line = json!({
                "type": "assistant",
                "sessionId": "sess-mid",
                "uuid": format!("a-{i}"),
                "timestamp": format!("2026-01-05T08:00:0{i}.000Z"),
                "message": {
                    "role": "assistant",
                    "model": "claude-opus-4-5",
                    "usage": {"input_tokens": 7, "output_tokens": 3},
                    "content": [{"type": "text", "text": format!("step {i}")}]
                }
            });
            format!("{line}\n")
        })
        .collect();
    std::fs::write(logs.join("session.jsonl"), body).expect("write session");

    let mut config = migration_config(&state);
    config.sync.batch_max_rows = 1;
    let store = Arc::new(MemoryEventStore::new());
    let gate = Arc::new(GateStore::new(store.clone(), Some("a-3")));
    let engine = SyncEngine::new(config.clone(), gate.clone()).expect("engine");
    let id = engine
        .start_historical_migration(&path_str(&logs))
        .await
        .expect("start");

    tokio::time::timeout(Duration::from_secs(10), gate.reached.notified())
        .await
        .expect("migration reached the third line");
    assert!(engine.pause_migration(&id).await.expect("pause"));
    let paused = engine.wait_migration(&id).await.expect("paused run");
    assert_eq!(paused.status, MigrationStatus::Paused);
    assert_eq!(paused.files_done, 0);
    // two lines are already in the store
    assert_eq!(
        store.total_tokens(&format!("{}/", path_str(&logs))).await.expect("total"),
        20
    );
    drop(engine);

    let engine = SyncEngine::new(config, store.clone()).expect("engine");
    engine.resume_migration(&id).await.expect("resume");
    let run = engine.wait_migration(&id).await.expect("completed run");

    assert_eq!(run.status, MigrationStatus::Completed);
    assert_eq!(run.files_done, 1);
    assert_eq!(run.tokens_seen, 40);
    assert_eq!(run.records_ingested, 4);
    let report = run.validation.expect("validation report");
    assert_eq!(report.source_tokens, 40);
    assert_eq!(report.store_tokens, 40);
    assert_eq!(store.row_count(Table::Messages).await.expect("rows"), 4);
}

#[tokio::test]
async fn malformed_glob_fails_the_run_instead_of_pausing() {
    let root = temp_root("badglob");
    let logs = root.join("logs");
    write_history(&logs);

    let mut config = migration_config(&root.join("state"));
    config.sync.file_glob = "**/[.jsonl".to_string();
    let engine =
        SyncEngine::new(config, Arc::new(MemoryEventStore::new())).expect("engine");
    let id = engine
        .start_historical_migration(&path_str(&logs))
        .await
        .expect("start");

    let err = engine.wait_migration(&id).await.expect_err("bad glob");
    assert!(matches!(err, SyncError::Config(_)));
    let run = engine.get_migration_status(&id).await.expect("run");
    assert_eq!(run.status, MigrationStatus::Failed);
    assert!(run.errors.iter().any(|line| line.starts_with("discovery:")));
}

#[tokio::test]
async fn silent_loss_fails_validation() {
    let root = temp_root("diverge");
    let logs = root.join("logs");
    write_history(&logs);

    let store = Arc::new(LossyStore {
        inner: Arc::new(MemoryEventStore::new()),
        needle: "file-03".to_string(),
        reject: false,
    });
    let engine = SyncEngine::new(migration_config(&root.join("state")), store).expect("engine");
    let id = engine
        .start_historical_migration(&path_str(&logs))
        .await
        .expect("start");

    let err = engine.wait_migration(&id).await.expect_err("divergence");
    assert!(matches!(
        err,
        SyncError::Validation {
            source_total: 605,
            store_total: 572,
            ..
        }
    ));

    let run = engine.get_migration_status(&id).await.expect("run");
    assert_eq!(run.status, MigrationStatus::Failed);
    assert_eq!(run.files_failed, 0);
    assert!(run.errors.iter().any(|line| line.starts_with("validation:")));
}

#[tokio::test]
async fn rejected_file_fails_alone_and_is_reported() {
    let root = temp_root("reject");
    let logs = root.join("logs");
    write_history(&logs);

    let mut config = migration_config(&root.join("state"));
    config.migration.validate_on_complete = false;
    config.migration.max_file_workers = 3;
    let store = Arc::new(LossyStore {
        inner: Arc::new(MemoryEventStore::new()),
        needle: "file-02".to_string(),
        reject: true,
    });
    let engine = SyncEngine::new(config, store).expect("engine");
    let id = engine
        .start_historical_migration(&path_str(&logs))
        .await
        .expect("start");
    let run = engine.wait_migration(&id).await.expect("run");

    assert_eq!(run.status, MigrationStatus::Failed);
    assert_eq!(run.files_done, 9);
    assert_eq!(run.files_failed, 1);
    let failed = run.failed_files();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].0.ends_with("file-02.jsonl"));
    assert!(run.errors.iter().any(|line| line.contains("file-02.jsonl")));
    assert_eq!(engine.dead_letters().len().expect("dead letters"), 1);
}
