use crate::error::{SyncError, SyncResult};
use crate::migration::MigrationRun;
use crate::model::Checkpoint;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

pub const LIVE_SCOPE: &str = "live";

pub fn migration_scope(run_id: &str) -> String {
    format!("migration-{run_id}")
}

pub(crate) fn checkpoint_key(scope: &str, source_file: &str) -> String {
    format!("{}\n{}", scope, source_file)
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether `incoming` may replace `existing`: a newer generation always wins,
/// within a generation the offset never moves backwards.
pub(crate) fn supersedes(existing: &Checkpoint, incoming: &Checkpoint) -> bool {
    incoming.source_generation > existing.source_generation
        || (incoming.source_generation == existing.source_generation
            && incoming.last_offset >= existing.last_offset)
}

type ScopeMap = BTreeMap<String, Checkpoint>;

/// Durable record of committed offsets and migration runs, and the per-file
/// lock of record for tail cursors.
///
/// Every (scope, file) pair persists to its own small JSON file, so a commit
/// costs one write regardless of how many files are tracked. Writes for one
/// key are serialized; different keys commit in parallel.
pub struct CheckpointStore {
    dir: Option<PathBuf>,
    scopes: Mutex<HashMap<String, ScopeMap>>,
    runs: Mutex<HashMap<String, MigrationRun>>,
    writers: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    leases: Arc<Mutex<HashSet<String>>>,
}

/// Exclusive tail cursor on one file within one scope; released on drop.
pub struct FileLease {
    key: String,
    leases: Arc<Mutex<HashSet<String>>>,
}

impl Drop for FileLease {
    fn drop(&mut self) {
        self.leases
            .lock()
            .expect("checkpoint lease mutex poisoned")
            .remove(&self.key);
    }
}

impl CheckpointStore {
    pub fn in_memory() -> Self {
        Self::with_state(None, HashMap::new(), HashMap::new())
    }

    fn with_state(
        dir: Option<PathBuf>,
        scopes: HashMap<String, ScopeMap>,
        runs: HashMap<String, MigrationRun>,
    ) -> Self {
        Self {
            dir,
            scopes: Mutex::new(scopes),
            runs: Mutex::new(runs),
            writers: Mutex::new(HashMap::new()),
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Opens (creating if needed) the store under `state_dir` and loads every
    /// persisted checkpoint and migration run. Unparseable files are skipped
    /// with a warning; their file is then read again from offset 0.
    pub fn open(state_dir: &Path) -> SyncResult<Self> {
        let checkpoints_dir = state_dir.join("checkpoints");
        let runs_dir = state_dir.join("migrations");
        for dir in [&checkpoints_dir, &runs_dir] {
            std::fs::create_dir_all(dir).map_err(|exc| {
                SyncError::Checkpoint(format!("failed to create {}: {exc}", dir.display()))
            })?;
        }

        let mut scopes: HashMap<String, ScopeMap> = HashMap::new();
        let mut loaded = 0usize;
        for scope_dir in sub_dirs(&checkpoints_dir)? {
            for path in json_files(&scope_dir)? {
                let Some(cp) = read_json::<Checkpoint>(&path) else {
                    continue;
                };
                loaded += 1;
                scopes
                    .entry(cp.scope.clone())
                    .or_default()
                    .insert(cp.source_file.clone(), cp);
            }
        }
        let mut runs = HashMap::new();
        for path in json_files(&runs_dir)? {
            if let Some(run) = read_json::<MigrationRun>(&path) {
                runs.insert(run.id.clone(), run);
            }
        }

        info!(
            "loaded {} checkpoints in {} scopes and {} migration runs from {}",
            loaded,
            scopes.len(),
            runs.len(),
            state_dir.display()
        );

        Ok(Self::with_state(Some(state_dir.to_path_buf()), scopes, runs))
    }

    pub fn try_lease(&self, scope: &str, source_file: &str) -> Option<FileLease> {
        let key = checkpoint_key(scope, source_file);
        let mut leases = self.leases.lock().expect("checkpoint lease mutex poisoned");
        if !leases.insert(key.clone()) {
            return None;
        }
        Some(FileLease {
            key,
            leases: self.leases.clone(),
        })
    }

    fn writer(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.writers
            .lock()
            .expect("checkpoint writer mutex poisoned")
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn lookup(&self, scope: &str, source_file: &str) -> Option<Checkpoint> {
        self.scopes
            .lock()
            .expect("checkpoint scope mutex poisoned")
            .get(scope)
            .and_then(|entries| entries.get(source_file))
            .cloned()
    }

    fn checkpoint_path(&self, scope: &str, source_file: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let name = format!("{:x}", Sha256::digest(source_file.as_bytes()));
        Some(
            dir.join("checkpoints")
                .join(file_safe(scope))
                .join(format!("{name}.json")),
        )
    }

    pub async fn get(&self, scope: &str, source_file: &str) -> Option<Checkpoint> {
        self.lookup(scope, source_file)
    }

    pub async fn scope_entries(&self, scope: &str) -> Vec<Checkpoint> {
        self.scopes
            .lock()
            .expect("checkpoint scope mutex poisoned")
            .get(scope)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Commits `checkpoint`. Only call once every batch holding rows from
    /// lines before `last_offset` was written or dead-lettered. The new
    /// position is visible to readers only after it is on disk.
    pub async fn commit(&self, mut checkpoint: Checkpoint) -> SyncResult<()> {
        checkpoint.updated_at_unix_ms = unix_ms_now();
        let writer = self.writer(&checkpoint_key(&checkpoint.scope, &checkpoint.source_file));
        let _write = writer.lock().await;

        if let Some(existing) = self.lookup(&checkpoint.scope, &checkpoint.source_file) {
            if !supersedes(&existing, &checkpoint) {
                return Err(SyncError::Checkpoint(format!(
                    "refusing to move {} back from {} to {} in generation {}",
                    checkpoint.source_file,
                    existing.last_offset,
                    checkpoint.last_offset,
                    checkpoint.source_generation
                )));
            }
        }

        if let Some(path) = self.checkpoint_path(&checkpoint.scope, &checkpoint.source_file) {
            write_json_durable(path, &checkpoint).await?;
        }
        debug!(
            scope = %checkpoint.scope,
            file = %checkpoint.source_file,
            offset = checkpoint.last_offset,
            generation = checkpoint.source_generation,
            "checkpoint committed"
        );
        self.scopes
            .lock()
            .expect("checkpoint scope mutex poisoned")
            .entry(checkpoint.scope.clone())
            .or_default()
            .insert(checkpoint.source_file.clone(), checkpoint);
        Ok(())
    }

    pub async fn remove(&self, scope: &str, source_file: &str) -> SyncResult<bool> {
        let writer = self.writer(&checkpoint_key(scope, source_file));
        let _write = writer.lock().await;
        if self.lookup(scope, source_file).is_none() {
            return Ok(false);
        }

        if let Some(path) = self.checkpoint_path(scope, source_file) {
            remove_durable(path).await?;
        }
        if let Some(entries) = self
            .scopes
            .lock()
            .expect("checkpoint scope mutex poisoned")
            .get_mut(scope)
        {
            entries.remove(source_file);
        }
        Ok(true)
    }

    pub async fn save_run(&self, run: &MigrationRun) -> SyncResult<()> {
        let writer = self.writer(&format!("run\n{}", run.id));
        let _write = writer.lock().await;
        if let Some(dir) = &self.dir {
            let path = dir
                .join("migrations")
                .join(format!("{}.json", file_safe(&run.id)));
            write_json_durable(path, run).await?;
        }
        self.runs
            .lock()
            .expect("migration run mutex poisoned")
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    pub async fn load_run(&self, run_id: &str) -> Option<MigrationRun> {
        self.runs
            .lock()
            .expect("migration run mutex poisoned")
            .get(run_id)
            .cloned()
    }

    pub async fn runs(&self) -> Vec<MigrationRun> {
        let mut runs: Vec<MigrationRun> = self
            .runs
            .lock()
            .expect("migration run mutex poisoned")
            .values()
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn list_dir(dir: &Path) -> SyncResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|exc| {
        SyncError::Checkpoint(format!("failed to list {}: {exc}", dir.display()))
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    paths.sort();
    Ok(paths)
}

fn sub_dirs(dir: &Path) -> SyncResult<Vec<PathBuf>> {
    Ok(list_dir(dir)?.into_iter().filter(|path| path.is_dir()).collect())
}

fn json_files(dir: &Path) -> SyncResult<Vec<PathBuf>> {
    Ok(list_dir(dir)?
        .into_iter()
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let parsed = std::fs::read_to_string(path)
        .map_err(|exc| exc.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|exc| exc.to_string()));
    match parsed {
        Ok(value) => Some(value),
        Err(exc) => {
            warn!("skipping unreadable state file {}: {exc}", path.display());
            None
        }
    }
}

fn io_failure(path: &Path, action: &str, exc: std::io::Error) -> SyncError {
    let display = path.display().to_string();
    match SyncError::from_io(&display, exc) {
        resource @ SyncError::Resource(_) => resource,
        other => SyncError::Checkpoint(format!("failed to {action} {display}: {other}")),
    }
}

/// Serializes `value` and replaces `path` with it: temp file, fsync, rename,
/// then fsync of the directory so the rename survives a power loss.
async fn write_json_durable<T: serde::Serialize + ?Sized>(
    path: PathBuf,
    value: &T,
) -> SyncResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|exc| SyncError::Checkpoint(format!("failed to serialize state: {exc}")))?;
    tokio::task::spawn_blocking(move || -> SyncResult<()> {
        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|exc| io_failure(parent, "create", exc))?;
        }
        let mut file = File::create(&tmp).map_err(|exc| io_failure(&tmp, "create", exc))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|exc| io_failure(&tmp, "write", exc))?;
        std::fs::rename(&tmp, &path).map_err(|exc| io_failure(&path, "replace", exc))?;
        sync_parent(&path);
        Ok(())
    })
    .await
    .map_err(|exc| SyncError::Checkpoint(format!("state writer task failed: {exc}")))?
}

async fn remove_durable(path: PathBuf) -> SyncResult<()> {
    tokio::task::spawn_blocking(move || -> SyncResult<()> {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(exc) if exc.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(exc) => return Err(io_failure(&path, "remove", exc)),
        }
        sync_parent(&path);
        Ok(())
    })
    .await
    .map_err(|exc| SyncError::Checkpoint(format!("state writer task failed: {exc}")))?
}

fn sync_parent(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Err(exc) = File::open(parent).and_then(|dir| dir.sync_all()) {
                debug!("failed to sync directory {}: {exc}", parent.display());
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MigrationRun, MigrationStatus};
    use crate::model::FileId;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_state_dir() -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "esker-checkpoints-{}-{}",
            std::process::id(),
            unique
        ))
    }

    fn checkpoint(offset: u64, generation: u32) -> Checkpoint {
        let id = FileId {
            path: "/logs/a.jsonl".to_string(),
            device: 1,
            inode: 42,
        };
        let mut cp = Checkpoint::initial(LIVE_SCOPE, &id);
        cp.last_offset = offset;
        cp.source_generation = generation;
        cp
    }

    #[tokio::test]
    async fn offsets_only_move_forward_within_a_generation() {
        let store = CheckpointStore::in_memory();
        store.commit(checkpoint(100, 1)).await.expect("first");
        store.commit(checkpoint(150, 1)).await.expect("forward");

        let err = store
            .commit(checkpoint(90, 1))
            .await
            .expect_err("regression rejected");
        assert!(matches!(err, SyncError::Checkpoint(_)));

        store.commit(checkpoint(0, 2)).await.expect("rotation reset");
        let current = store.get(LIVE_SCOPE, "/logs/a.jsonl").await.expect("cp");
        assert_eq!(current.last_offset, 0);
        assert_eq!(current.source_generation, 2);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let store = CheckpointStore::in_memory();
        store.commit(checkpoint(100, 1)).await.expect("live");

        let mut run_cp = checkpoint(10, 1);
        run_cp.scope = migration_scope("run-1");
        store.commit(run_cp).await.expect("run");

        assert_eq!(store.scope_entries(LIVE_SCOPE).await[0].last_offset, 100);
        assert_eq!(
            store.scope_entries(&migration_scope("run-1")).await[0].last_offset,
            10
        );
    }

    #[tokio::test]
    async fn persisted_state_survives_reopen() {
        let dir = temp_state_dir();
        {
            let store = CheckpointStore::open(&dir).expect("open");
            store.commit(checkpoint(64, 3)).await.expect("commit");
            let mut run = MigrationRun::new("run-7", "/logs");
            run.status = MigrationStatus::Paused;
            store.save_run(&run).await.expect("save run");
        }

        let reopened = CheckpointStore::open(&dir).expect("reopen");
        let cp = reopened.get(LIVE_SCOPE, "/logs/a.jsonl").await.expect("cp");
        assert_eq!(cp.last_offset, 64);
        assert_eq!(cp.source_generation, 3);
        let run = reopened.load_run("run-7").await.expect("run");
        assert_eq!(run.status, MigrationStatus::Paused);

        assert!(reopened
            .remove(LIVE_SCOPE, "/logs/a.jsonl")
            .await
            .expect("remove"));
        assert!(reopened.get(LIVE_SCOPE, "/logs/a.jsonl").await.is_none());
    }

    fn json_names(dir: &Path) -> Vec<String> {
        list_dir(dir)
            .expect("list")
            .iter()
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect()
    }

    #[tokio::test]
    async fn each_file_is_persisted_on_its_own() {
        let dir = temp_state_dir();
        let store = CheckpointStore::open(&dir).expect("open");
        store.commit(checkpoint(10, 1)).await.expect("a");
        let mut other = checkpoint(20, 1);
        other.source_file = "/logs/b.jsonl".to_string();
        store.commit(other).await.expect("b");
        store.commit(checkpoint(30, 1)).await.expect("a again");
        let mut run_cp = checkpoint(5, 1);
        run_cp.scope = migration_scope("run-1");
        store.commit(run_cp).await.expect("run");

        let live_dir = dir.join("checkpoints").join(LIVE_SCOPE);
        let names = json_names(&live_dir);
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|name| name.ends_with(".json")));
        assert_eq!(json_names(&dir.join("checkpoints")).len(), 2);

        let path = store
            .checkpoint_path(LIVE_SCOPE, "/logs/a.jsonl")
            .expect("path");
        let on_disk: Checkpoint =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("parse");
        assert_eq!(on_disk.last_offset, 30);

        assert!(store.remove(LIVE_SCOPE, "/logs/a.jsonl").await.expect("remove"));
        assert!(!path.exists());
        assert_eq!(json_names(&live_dir).len(), 1);
    }

    #[tokio::test]
    async fn torn_checkpoint_file_is_skipped_on_open() {
        let dir = temp_state_dir();
        {
            let store = CheckpointStore::open(&dir).expect("open");
            store.commit(checkpoint(64, 1)).await.expect("a");
            let mut other = checkpoint(128, 1);
            other.source_file = "/logs/b.jsonl".to_string();
            store.commit(other).await.expect("b");

            let path = store
                .checkpoint_path(LIVE_SCOPE, "/logs/a.jsonl")
                .expect("path");
            std::fs::write(&path, b"{\"scope\": \"li").expect("tear file");
        }

        let reopened = CheckpointStore::open(&dir).expect("reopen despite torn file");
        assert!(reopened.get(LIVE_SCOPE, "/logs/a.jsonl").await.is_none());
        let b = reopened.get(LIVE_SCOPE, "/logs/b.jsonl").await.expect("b");
        assert_eq!(b.last_offset, 128);

        reopened.commit(checkpoint(8, 1)).await.expect("fresh start");
        assert_eq!(
            reopened
                .get(LIVE_SCOPE, "/logs/a.jsonl")
                .await
                .expect("a")
                .last_offset,
            8
        );
    }

    #[tokio::test]
    async fn concurrent_commits_to_many_files_all_persist() {
        let dir = temp_state_dir();
        let store = Arc::new(CheckpointStore::open(&dir).expect("open"));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16u64 {
            let store = store.clone();
            tasks.spawn(async move {
                for step in 1..=5u64 {
                    let mut cp = checkpoint(step * 10, 1);
                    cp.source_file = format!("/logs/{i}.jsonl");
                    store.commit(cp).await.expect("commit");
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("commit task");
        }

        let reopened = CheckpointStore::open(&dir).expect("reopen");
        let entries = reopened.scope_entries(LIVE_SCOPE).await;
        assert_eq!(entries.len(), 16);
        assert!(entries.iter().all(|cp| cp.last_offset == 50));
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let store = CheckpointStore::in_memory();
        let lease = store.try_lease(LIVE_SCOPE, "/logs/a.jsonl").expect("lease");
        assert!(store.try_lease(LIVE_SCOPE, "/logs/a.jsonl").is_none());
        assert!(store.try_lease("other", "/logs/a.jsonl").is_some());
        drop(lease);
        assert!(store.try_lease(LIVE_SCOPE, "/logs/a.jsonl").is_some());
    }
}
