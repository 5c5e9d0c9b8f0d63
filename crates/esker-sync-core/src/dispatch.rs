use crate::checkpoint::checkpoint_key;
use crate::metrics::Metrics;
use crate::pipeline::{sync_file, PipelineContext};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const RESOURCE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkItem {
    pub(crate) scope: String,
    pub(crate) path: String,
}

impl WorkItem {
    pub(crate) fn key(&self) -> String {
        checkpoint_key(&self.scope, &self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    Running,
    /// Changed again while a worker had it; runs once more afterwards.
    RunningDirty,
}

/// Coalesces change notifications so each file is queued at most once and
/// processed by at most one worker at a time.
#[derive(Default)]
pub(crate) struct DispatchState {
    slots: HashMap<String, (Slot, WorkItem)>,
}

impl DispatchState {
    /// Records a change for `work`. Returns true when the caller should put
    /// it on the queue.
    fn offer(&mut self, work: WorkItem) -> bool {
        let key = work.key();
        match self.slots.get_mut(&key) {
            Some((Slot::Queued, _)) => false,
            Some((slot, item)) => {
                *slot = Slot::RunningDirty;
                *item = work;
                false
            }
            None => {
                self.slots.insert(key, (Slot::Queued, work));
                true
            }
        }
    }

    fn start(&mut self, work: &WorkItem) {
        let slot = self
            .slots
            .entry(work.key())
            .or_insert_with(|| (Slot::Running, work.clone()));
        slot.0 = Slot::Running;
    }

    fn mark_dirty(&mut self, key: &str) {
        if let Some((slot, _)) = self.slots.get_mut(key) {
            *slot = Slot::RunningDirty;
        }
    }

    /// Releases a finished file. A file that changed while running comes back
    /// for requeueing; an idle one is forgotten.
    fn finish(&mut self, key: &str) -> Option<WorkItem> {
        match self.slots.get(key).map(|(slot, _)| *slot) {
            Some(Slot::RunningDirty) => {
                let (slot, item) = self.slots.get_mut(key)?;
                *slot = Slot::Queued;
                Some(item.clone())
            }
            Some(Slot::Running) => {
                self.slots.remove(key);
                None
            }
            Some(Slot::Queued) | None => None,
        }
    }
}

pub(crate) async fn enqueue_work(
    work: WorkItem,
    process_tx: &mpsc::Sender<WorkItem>,
    dispatch: &Arc<Mutex<DispatchState>>,
    metrics: &Arc<Metrics>,
) {
    let should_send = dispatch
        .lock()
        .expect("dispatch mutex poisoned")
        .offer(work.clone());
    if should_send && process_tx.send(work).await.is_ok() {
        metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consumes queued files with at most `max_workers` tail cycles in flight.
/// Stops taking work on cancellation and waits for running cycles.
pub(crate) fn spawn_worker_pool(
    ctx: Arc<PipelineContext>,
    mut process_rx: mpsc::Receiver<WorkItem>,
    process_tx: mpsc::Sender<WorkItem>,
    dispatch: Arc<Mutex<DispatchState>>,
    max_workers: usize,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sem = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut workers = JoinSet::new();

        loop {
            let work = tokio::select! {
                _ = cancel.cancelled() => break,
                next = process_rx.recv() => match next {
                    Some(work) => work,
                    None => break,
                },
            };
            ctx.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
            dispatch
                .lock()
                .expect("dispatch mutex poisoned")
                .start(&work);

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let ctx = ctx.clone();
            let dispatch = dispatch.clone();
            let process_tx = process_tx.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                let key = work.key();
                match sync_file(&ctx, &work.scope, &work.path, &cancel).await {
                    Ok(report) => debug!(
                        file = %work.path,
                        rows = report.rows,
                        offset = report.committed_offset,
                        "live cycle complete"
                    ),
                    Err(exc) if exc.is_resource() => {
                        warn!(file = %work.path, "resource pressure: {exc}");
                        ctx.metrics.record_error(exc.to_string());
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(RESOURCE_BACKOFF) => {}
                        }
                        dispatch
                            .lock()
                            .expect("dispatch mutex poisoned")
                            .mark_dirty(&key);
                    }
                    Err(exc) => {
                        error!(file = %work.path, scope = %work.scope, "tail cycle failed: {exc}");
                        ctx.metrics.record_error(exc.to_string());
                    }
                }

                let again = dispatch
                    .lock()
                    .expect("dispatch mutex poisoned")
                    .finish(&key);
                if let Some(item) = again {
                    if !cancel.is_cancelled() && process_tx.send(item).await.is_ok() {
                        ctx.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });

            while workers.try_join_next().is_some() {}
        }

        while workers.join_next().await.is_some() {}
    })
}
