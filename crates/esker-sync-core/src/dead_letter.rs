use crate::batch::Batch;
use crate::error::{IngestErrorKind, SyncError, SyncResult};
use crate::model::Table;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub table: Table,
    pub dedup_token: String,
    pub kind: IngestErrorKind,
    pub error: String,
    pub attempts: u32,
    pub failed_at: String,
    pub source_files: Vec<String>,
    pub rows: Vec<Value>,
}

impl DeadLetterEntry {
    pub fn from_batch(batch: &Batch, kind: IngestErrorKind, error: &str, attempts: u32) -> Self {
        let source_files: BTreeSet<String> = batch
            .rows
            .iter()
            .filter_map(|row| row.value.get("source_file").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        Self {
            table: batch.table,
            dedup_token: batch.dedup_token(),
            kind,
            error: error.to_string(),
            attempts,
            failed_at: Utc::now().to_rfc3339(),
            source_files: source_files.into_iter().collect(),
            rows: batch.values(),
        }
    }
}

/// Batches that could not be written, one JSON line per batch under
/// `<state_dir>/dead_letter/<table>.jsonl`. Entries are kept until an
/// operator removes the files.
pub struct DeadLetterQueue {
    dir: Option<PathBuf>,
    memory: Mutex<Vec<DeadLetterEntry>>,
}

impl DeadLetterQueue {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            memory: Mutex::new(Vec::new()),
        }
    }

    pub fn open(state_dir: &Path) -> SyncResult<Self> {
        let dir = state_dir.join("dead_letter");
        std::fs::create_dir_all(&dir)
            .map_err(|exc| SyncError::from_io(&dir.display().to_string(), exc))?;
        Ok(Self {
            dir: Some(dir),
            memory: Mutex::new(Vec::new()),
        })
    }

    pub fn append(&self, entry: &DeadLetterEntry) -> SyncResult<()> {
        let Some(dir) = &self.dir else {
            self.memory
                .lock()
                .expect("dead letter mutex poisoned")
                .push(entry.clone());
            return Ok(());
        };

        let path = dir.join(format!("{}.jsonl", entry.table.name()));
        let display = path.display().to_string();
        let mut line = serde_json::to_vec(entry).map_err(|exc| {
            SyncError::Checkpoint(format!("failed to encode dead letter entry: {exc}"))
        })?;
        line.push(b'\n');

        // appends from concurrent workers must not interleave
        let _guard = self.memory.lock().expect("dead letter mutex poisoned");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|exc| SyncError::from_io(&display, exc))?;
        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|exc| SyncError::from_io(&display, exc))
    }

    pub fn entries(&self) -> SyncResult<Vec<DeadLetterEntry>> {
        let Some(dir) = &self.dir else {
            return Ok(self
                .memory
                .lock()
                .expect("dead letter mutex poisoned")
                .clone());
        };

        let mut entries = Vec::new();
        for table in Table::EVENT_TABLES {
            let path = dir.join(format!("{}.jsonl", table.name()));
            let file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(exc) if exc.kind() == std::io::ErrorKind::NotFound => continue,
                Err(exc) => return Err(SyncError::from_io(&path.display().to_string(), exc)),
            };
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line =
                    line.map_err(|exc| SyncError::from_io(&path.display().to_string(), exc))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<DeadLetterEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(exc) => warn!(
                        "skipping unreadable dead letter {}:{}: {exc}",
                        path.display(),
                        idx + 1
                    ),
                }
            }
        }
        entries.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        Ok(entries)
    }

    pub fn len(&self) -> SyncResult<usize> {
        self.entries().map(|entries| entries.len())
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        self.len().map(|len| len == 0)
    }
}
