use crate::checkpoint::{unix_ms_now, CheckpointStore};
use crate::error::{SyncError, SyncResult};
use crate::metrics::{
    Metrics, WATCHER_BACKEND_MIXED, WATCHER_BACKEND_NATIVE, WATCHER_BACKEND_POLL,
    WATCHER_BACKEND_UNKNOWN,
};
use crate::model::{Checkpoint, FileId, WatchedFile};
use crate::tailer::window_fingerprint;
use esker_config::{SyncConfig, WatchMode};
use glob::{glob, Pattern};
use notify::{
    event::{EventKind, ModifyKind},
    Config as NotifyConfig, Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Appended,
    Truncated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub file: WatchedFile,
    pub kind: ChangeKind,
}

/// Decides what happened to a file since its committed checkpoint.
pub(crate) fn detect_change(
    id: &FileId,
    size: u64,
    checkpoint: Option<&Checkpoint>,
    fingerprint_window: u64,
) -> SyncResult<Option<ChangeKind>> {
    let Some(cp) = checkpoint else {
        return Ok(Some(ChangeKind::Created));
    };

    if cp.identity_changed(id) || size < cp.last_offset {
        return Ok(Some(ChangeKind::Truncated));
    }

    if !cp.fingerprint.is_empty()
        && window_fingerprint(&id.path, cp.last_offset, fingerprint_window)? != cp.fingerprint
    {
        return Ok(Some(ChangeKind::Truncated));
    }

    if size > cp.last_offset {
        Ok(Some(ChangeKind::Appended))
    } else {
        Ok(None)
    }
}

pub struct Scanner {
    root: PathBuf,
    pattern: String,
    matcher: Pattern,
    fingerprint_window: u64,
}

impl Scanner {
    pub fn new(root: &Path, file_glob: &str, fingerprint_window: u64) -> SyncResult<Self> {
        let pattern = root.join(file_glob).to_string_lossy().to_string();
        let matcher = Pattern::new(&pattern).map_err(|exc| {
            SyncError::Config(format!("invalid file glob {pattern}: {exc}"))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            pattern,
            matcher,
            fingerprint_window,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.matcher.matches_path(path)
    }

    pub fn enumerate(&self) -> SyncResult<Vec<String>> {
        enumerate_files(&self.pattern)
    }

    /// Change for a single path, `None` when nothing needs processing. A file
    /// vanishing while it is inspected is reported as deleted.
    pub async fn inspect(
        &self,
        path: &str,
        checkpoints: &CheckpointStore,
        scope: &str,
    ) -> SyncResult<Option<FileChange>> {
        let checkpoint = checkpoints.get(scope, path).await;

        let meta = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(exc) if exc.kind() == std::io::ErrorKind::NotFound => {
                return Ok(checkpoint.map(|cp| deleted(path, &cp)));
            }
            Err(exc) => return Err(SyncError::from_io(path, exc)),
        };

        let id = FileId::from_metadata(path, &meta);
        let kind = match detect_change(&id, meta.len(), checkpoint.as_ref(), self.fingerprint_window)
        {
            Ok(kind) => kind,
            Err(SyncError::FileAccess { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                return Ok(checkpoint.map(|cp| deleted(path, &cp)));
            }
            Err(exc) => return Err(exc),
        };

        Ok(kind.map(|kind| FileChange {
            file: WatchedFile {
                size: meta.len(),
                modified_unix_ms: meta
                    .modified()
                    .ok()
                    .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default(),
                last_offset: checkpoint.as_ref().map(|cp| cp.last_offset).unwrap_or(0),
                fingerprint: checkpoint.map(|cp| cp.fingerprint).unwrap_or_default(),
                id,
            },
            kind,
        }))
    }

    /// Full pass over the root: every matching file plus every checkpointed
    /// file under the root that no longer exists.
    pub async fn scan(
        &self,
        checkpoints: &CheckpointStore,
        scope: &str,
    ) -> SyncResult<Vec<FileChange>> {
        let mut paths: BTreeSet<String> = self.enumerate()?.into_iter().collect();
        for cp in checkpoints.scope_entries(scope).await {
            if Path::new(&cp.source_file).starts_with(&self.root) {
                paths.insert(cp.source_file);
            }
        }

        let mut changes = Vec::new();
        for path in paths {
            match self.inspect(&path, checkpoints, scope).await {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => {}
                Err(exc) if exc.is_resource() => return Err(exc),
                Err(exc) => warn!("skipping {path} during scan: {exc}"),
            }
        }
        Ok(changes)
    }
}

fn deleted(path: &str, cp: &Checkpoint) -> FileChange {
    FileChange {
        file: WatchedFile {
            id: FileId {
                path: path.to_string(),
                device: cp.source_device,
                inode: cp.source_inode,
            },
            size: 0,
            modified_unix_ms: 0,
            last_offset: cp.last_offset,
            fingerprint: cp.fingerprint.clone(),
        },
        kind: ChangeKind::Deleted,
    }
}

pub fn enumerate_files(glob_pattern: &str) -> SyncResult<Vec<String>> {
    let entries = glob(glob_pattern)
        .map_err(|exc| SyncError::Config(format!("invalid glob {glob_pattern}: {exc}")))?;

    let mut files = Vec::<String>::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(exc) => {
                warn!("glob iteration error: {exc}");
                continue;
            }
        };
        if path.is_file() {
            files.push(path.to_string_lossy().to_string());
        }
    }
    files.sort();
    Ok(files)
}

enum ActiveWatcher {
    Recommended(RecommendedWatcher),
    Poll(PollWatcher),
}

impl ActiveWatcher {
    fn watch(&mut self, path: &Path, mode: RecursiveMode) -> notify::Result<()> {
        match self {
            Self::Recommended(watcher) => watcher.watch(path, mode),
            Self::Poll(watcher) => watcher.watch(path, mode),
        }
    }
}

#[derive(Clone, Copy)]
enum WatcherBackend {
    Native,
    Poll,
}

impl WatcherBackend {
    fn state(self) -> u64 {
        match self {
            Self::Native => WATCHER_BACKEND_NATIVE,
            Self::Poll => WATCHER_BACKEND_POLL,
        }
    }
}

struct WatchRegistration {
    metrics: Arc<Metrics>,
    registered: bool,
}

impl WatchRegistration {
    fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            registered: false,
        }
    }

    fn mark_registered(&mut self) {
        if self.registered {
            return;
        }
        self.metrics
            .watcher_registrations
            .fetch_add(1, Ordering::Relaxed);
        self.registered = true;
    }
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        self.metrics
            .watcher_registrations
            .fetch_sub(1, Ordering::Relaxed);
    }
}

fn record_backend(metrics: &Metrics, backend: WatcherBackend) {
    let next = backend.state();
    let mut current = metrics.watcher_backend_state.load(Ordering::Relaxed);

    loop {
        let merged = match (current, next) {
            (WATCHER_BACKEND_UNKNOWN, value) => value,
            (value, next_value) if value == next_value => value,
            _ => WATCHER_BACKEND_MIXED,
        };

        match metrics.watcher_backend_state.compare_exchange(
            current,
            merged,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

fn record_watcher_error(metrics: &Metrics, message: &str) {
    metrics.watcher_error_count.fetch_add(1, Ordering::Relaxed);
    metrics.record_error(message);
}

fn record_rescan(metrics: &Metrics) {
    metrics.watcher_reset_count.fetch_add(1, Ordering::Relaxed);
    metrics
        .watcher_last_reset_unix_ms
        .store(unix_ms_now(), Ordering::Relaxed);
}

fn event_requires_rescan(event: &Event) -> bool {
    event.paths.is_empty() || event.need_rescan()
}

fn event_is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Any | EventKind::Create(_) | EventKind::Remove(_) => true,
        EventKind::Modify(modify_kind) => matches!(
            modify_kind,
            ModifyKind::Any | ModifyKind::Data(_) | ModifyKind::Name(_)
        ),
        _ => false,
    }
}

fn event_matching_paths(event: &Event, matcher: &Pattern) -> Vec<String> {
    let mut dedup = BTreeSet::<String>::new();
    for path in &event.paths {
        if matcher.matches_path(path) {
            dedup.insert(path.to_string_lossy().to_string());
        }
    }
    dedup.into_iter().collect()
}

#[derive(Debug)]
enum WatchSignal {
    Paths(Vec<String>),
    Rescan,
}

enum Wake {
    Cancelled,
    Signal(Option<WatchSignal>),
    Reconcile,
    Poll,
}

async fn poll_tick(poll: Option<&mut Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn interval_after(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Pull-based sequence of file changes under one root.
///
/// Watcher events only nominate paths; the scanner compares each nominated
/// file against its checkpoint to decide the change kind. A periodic
/// reconcile pass and watcher rescan requests cover events the backend drops.
pub struct ChangeStream {
    scanner: Scanner,
    checkpoints: Arc<CheckpointStore>,
    scope: String,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    signals: mpsc::UnboundedReceiver<WatchSignal>,
    _signal_tx: mpsc::UnboundedSender<WatchSignal>,
    queue: VecDeque<FileChange>,
    primed: bool,
    debounce: Duration,
    reconcile: Interval,
    poll: Option<Interval>,
    _watcher: Option<ActiveWatcher>,
    _registration: WatchRegistration,
}

impl ChangeStream {
    pub fn open(
        scanner: Scanner,
        mode: WatchMode,
        config: &SyncConfig,
        checkpoints: Arc<CheckpointStore>,
        scope: &str,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> SyncResult<Self> {
        let (signal_tx, signals) = mpsc::unbounded_channel::<WatchSignal>();
        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(10));
        let mut registration = WatchRegistration::new(metrics.clone());

        let watcher = match mode {
            WatchMode::Native => {
                start_watcher(&scanner, poll_interval, &signal_tx, &metrics, &mut registration)
            }
            WatchMode::Poll => None,
        };
        let poll = if watcher.is_none() {
            record_backend(&metrics, WatcherBackend::Poll);
            info!(
                "polling {} every {} ms",
                scanner.root().display(),
                poll_interval.as_millis()
            );
            Some(interval_after(poll_interval))
        } else {
            None
        };

        Ok(Self {
            scanner,
            checkpoints,
            scope: scope.to_string(),
            metrics,
            cancel,
            signals,
            _signal_tx: signal_tx,
            queue: VecDeque::new(),
            primed: false,
            debounce: Duration::from_millis(config.debounce_ms.max(5)),
            reconcile: interval_after(Duration::from_secs_f64(
                config.reconcile_interval_seconds.max(1.0),
            )),
            poll,
            _watcher: watcher,
            _registration: registration,
        })
    }

    /// Next change, waiting for one if none is queued. `None` once cancelled.
    pub async fn next(&mut self) -> Option<FileChange> {
        loop {
            if let Some(change) = self.queue.pop_front() {
                return Some(change);
            }
            if self.cancel.is_cancelled() {
                return None;
            }
            if !self.primed {
                self.primed = true;
                self.rescan().await;
                continue;
            }

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                signal = self.signals.recv() => Wake::Signal(signal),
                _ = self.reconcile.tick() => Wake::Reconcile,
                _ = poll_tick(self.poll.as_mut()) => Wake::Poll,
            };

            match wake {
                Wake::Cancelled | Wake::Signal(None) => return None,
                Wake::Signal(Some(first)) => self.absorb_signals(first).await,
                Wake::Reconcile => {
                    debug!("reconcile pass over {}", self.scanner.root().display());
                    record_rescan(&self.metrics);
                    self.rescan().await;
                }
                Wake::Poll => self.rescan().await,
            }
        }
    }

    async fn absorb_signals(&mut self, first: WatchSignal) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.debounce) => {}
        }

        let mut paths = BTreeSet::<String>::new();
        let mut rescan = false;
        let mut pending = Some(first);
        while let Some(signal) = pending.take().or_else(|| self.signals.try_recv().ok()) {
            match signal {
                WatchSignal::Paths(nominated) => paths.extend(nominated),
                WatchSignal::Rescan => rescan = true,
            }
        }

        if rescan {
            record_rescan(&self.metrics);
            self.rescan().await;
            return;
        }

        for path in paths {
            match self
                .scanner
                .inspect(&path, &self.checkpoints, &self.scope)
                .await
            {
                Ok(Some(change)) => self.queue.push_back(change),
                Ok(None) => {}
                Err(exc) => {
                    warn!("failed to inspect {path}: {exc}");
                    self.metrics.record_error(exc.to_string());
                }
            }
        }
    }

    async fn rescan(&mut self) {
        match self.scanner.scan(&self.checkpoints, &self.scope).await {
            Ok(changes) => self.queue.extend(changes),
            Err(exc) => {
                warn!("scan of {} failed: {exc}", self.scanner.root().display());
                self.metrics.record_error(exc.to_string());
            }
        }
    }
}

fn start_watcher(
    scanner: &Scanner,
    poll_interval: Duration,
    signal_tx: &mpsc::UnboundedSender<WatchSignal>,
    metrics: &Arc<Metrics>,
    registration: &mut WatchRegistration,
) -> Option<ActiveWatcher> {
    let handler = {
        let tx = signal_tx.clone();
        let matcher = scanner.matcher.clone();
        let metrics = metrics.clone();
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if event_requires_rescan(&event) {
                    let _ = tx.send(WatchSignal::Rescan);
                    return;
                }
                if !event_is_relevant(&event.kind) {
                    return;
                }
                let paths = event_matching_paths(&event, &matcher);
                if !paths.is_empty() {
                    let _ = tx.send(WatchSignal::Paths(paths));
                }
            }
            Err(exc) => {
                warn!("watcher event error: {exc}");
                record_watcher_error(&metrics, &format!("watcher event error: {exc}"));
                let _ = tx.send(WatchSignal::Rescan);
            }
        }
    };

    let mut watcher = match notify::recommended_watcher(handler.clone()) {
        Ok(watcher) => {
            record_backend(metrics, WatcherBackend::Native);
            info!("watcher backend native ({})", scanner.root().display());
            ActiveWatcher::Recommended(watcher)
        }
        Err(exc) => {
            warn!("failed to create native watcher: {exc}; falling back to poll watcher");
            record_watcher_error(metrics, &format!("native watcher create failed: {exc}"));
            let poll_config = NotifyConfig::default().with_poll_interval(poll_interval);
            match PollWatcher::new(handler, poll_config) {
                Ok(watcher) => {
                    record_backend(metrics, WatcherBackend::Poll);
                    info!("watcher backend poll ({})", scanner.root().display());
                    ActiveWatcher::Poll(watcher)
                }
                Err(poll_exc) => {
                    warn!("failed to create poll watcher: {poll_exc}");
                    record_watcher_error(
                        metrics,
                        &format!("poll watcher create failed: {poll_exc}"),
                    );
                    return None;
                }
            }
        }
    };

    if let Err(exc) = watcher.watch(scanner.root(), RecursiveMode::Recursive) {
        warn!("failed to watch {}: {exc}", scanner.root().display());
        record_watcher_error(
            metrics,
            &format!(
                "watch root register failed for {}: {exc}",
                scanner.root().display()
            ),
        );
        return None;
    }
    registration.mark_registered();
    Some(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::LIVE_SCOPE;
    use notify::event::{CreateKind, DataChange, Flag, RemoveKind, RenameMode};
    use std::time::SystemTime;

    fn temp_root(label: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "esker-discovery-{label}-{}-{}",
            std::process::id(),
            unique
        ));
        std::fs::create_dir_all(&dir).expect("create temp root");
        dir
    }

    async fn commit_at(store: &CheckpointStore, path: &str, offset: u64, window: u64) {
        let meta = std::fs::metadata(path).expect("metadata");
        let mut cp = Checkpoint::initial(LIVE_SCOPE, &FileId::from_metadata(path, &meta));
        cp.last_offset = offset;
        cp.fingerprint = window_fingerprint(path, offset, window).expect("fingerprint");
        store.commit(cp).await.expect("commit");
    }

    #[test]
    fn rescan_events_require_reconcile() {
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert!(event_requires_rescan(&event));
    }

    #[test]
    fn relevant_event_kinds_include_create_modify_rename_and_remove() {
        assert!(event_is_relevant(&EventKind::Create(CreateKind::Any)));
        assert!(event_is_relevant(&EventKind::Modify(ModifyKind::Data(
            DataChange::Any
        ))));
        assert!(event_is_relevant(&EventKind::Modify(ModifyKind::Name(
            RenameMode::Any
        ))));
        assert!(event_is_relevant(&EventKind::Remove(RemoveKind::Any)));
        assert!(!event_is_relevant(&EventKind::Access(
            notify::event::AccessKind::Any
        )));
    }

    #[test]
    fn matching_paths_are_deduped_and_filtered() {
        let matcher = Pattern::new("/tmp/**/*.jsonl").expect("pattern");
        let mut event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Any)));
        event.paths = vec![
            PathBuf::from("/tmp/p/a.jsonl"),
            PathBuf::from("/tmp/p/a.jsonl"),
            PathBuf::from("/tmp/p/b.txt"),
        ];

        let paths = event_matching_paths(&event, &matcher);
        assert_eq!(paths, vec!["/tmp/p/a.jsonl".to_string()]);
    }

    #[test]
    fn watcher_registration_tracks_active_watches() {
        let metrics = Arc::new(Metrics::default());
        assert_eq!(metrics.watcher_registrations.load(Ordering::Relaxed), 0);

        {
            let mut registration = WatchRegistration::new(metrics.clone());
            registration.mark_registered();
            assert_eq!(metrics.watcher_registrations.load(Ordering::Relaxed), 1);
        }

        assert_eq!(metrics.watcher_registrations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn backend_state_merges_to_mixed() {
        let metrics = Metrics::default();
        record_backend(&metrics, WatcherBackend::Native);
        assert_eq!(metrics.watcher_backend(), "native");
        record_backend(&metrics, WatcherBackend::Poll);
        assert_eq!(metrics.watcher_backend(), "mixed");
    }

    #[test]
    fn malformed_glob_is_a_config_error() {
        let err = Scanner::new(Path::new("/tmp/logs"), "**/[.jsonl", 1024)
            .err()
            .expect("unclosed bracket rejected");
        assert!(matches!(err, SyncError::Config(_)));
        assert!(!err.is_resource());
        assert_eq!(err.kind_label(), "config");

        let err = enumerate_files("/tmp/logs/[").expect_err("unclosed bracket rejected");
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn scan_reports_created_appended_truncated_and_deleted() {
        let root = temp_root("kinds");
        std::fs::create_dir_all(root.join("p1")).expect("project dir");
        let fresh = root.join("p1/fresh.jsonl");
        let grown = root.join("p1/grown.jsonl");
        let shrunk = root.join("p1/shrunk.jsonl");
        let gone = root.join("p1/gone.jsonl");
        let same = root.join("p1/same.jsonl");
        for path in [&fresh, &grown, &shrunk, &gone, &same] {
            std::fs::write(path, b"{\"a\":1}\n").expect("write");
        }
        std::fs::write(root.join("p1/notes.txt"), b"ignored").expect("write txt");

        let store = CheckpointStore::in_memory();
        for path in [&grown, &shrunk, &gone, &same] {
            commit_at(&store, &path.to_string_lossy(), 8, 1024).await;
        }

        std::fs::write(&grown, b"{\"a\":1}\n{\"b\":2}\n").expect("append");
        std::fs::write(&shrunk, b"{}\n").expect("truncate");
        std::fs::remove_file(&gone).expect("remove");

        let scanner = Scanner::new(&root, "**/*.jsonl", 1024).expect("scanner");
        let changes = scanner.scan(&store, LIVE_SCOPE).await.expect("scan");
        let kind_of = |path: &PathBuf| {
            changes
                .iter()
                .find(|c| c.file.id.path == path.to_string_lossy())
                .map(|c| c.kind)
        };

        assert_eq!(changes.len(), 4);
        assert_eq!(kind_of(&fresh), Some(ChangeKind::Created));
        assert_eq!(kind_of(&grown), Some(ChangeKind::Appended));
        assert_eq!(kind_of(&shrunk), Some(ChangeKind::Truncated));
        assert_eq!(kind_of(&gone), Some(ChangeKind::Deleted));
        assert_eq!(kind_of(&same), None);
    }

    #[tokio::test]
    async fn rewrite_to_same_length_is_truncation() {
        let root = temp_root("rewrite");
        let path = root.join("a.jsonl");
        std::fs::write(&path, b"{\"a\":1}\n").expect("write");
        let store = CheckpointStore::in_memory();
        commit_at(&store, &path.to_string_lossy(), 8, 1024).await;

        std::fs::write(&path, b"{\"z\":9}\n{\"b\":2}\n").expect("rewrite");
        let scanner = Scanner::new(&root, "*.jsonl", 1024).expect("scanner");
        let change = scanner
            .inspect(&path.to_string_lossy(), &store, LIVE_SCOPE)
            .await
            .expect("inspect")
            .expect("change");
        assert_eq!(change.kind, ChangeKind::Truncated);
    }

    #[tokio::test]
    async fn poll_stream_yields_initial_scan_then_appends() {
        let root = temp_root("stream");
        let path = root.join("a.jsonl");
        std::fs::write(&path, b"{\"a\":1}\n").expect("write");

        let mut config = SyncConfig::default();
        config.poll_interval_ms = 20;
        let store = Arc::new(CheckpointStore::in_memory());
        let cancel = CancellationToken::new();
        let mut stream = ChangeStream::open(
            Scanner::new(&root, "*.jsonl", 1024).expect("scanner"),
            WatchMode::Poll,
            &config,
            store.clone(),
            LIVE_SCOPE,
            Arc::new(Metrics::default()),
            cancel.clone(),
        )
        .expect("stream");

        let first = stream.next().await.expect("initial change");
        assert_eq!(first.kind, ChangeKind::Created);
        commit_at(&store, &path.to_string_lossy(), 8, 1024).await;

        std::fs::write(&path, b"{\"a\":1}\n{\"b\":2}\n").expect("append");
        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("change before timeout")
            .expect("appended change");
        assert_eq!(second.kind, ChangeKind::Appended);

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
