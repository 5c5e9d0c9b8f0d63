use crate::batch::Batch;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use crate::error::{IngestErrorKind, SyncError, SyncResult};
use crate::metrics::Metrics;
use crate::store::EventStore;
use esker_clickhouse::ClickHouseError;
use esker_config::IngestConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            multiplier: config.retry_multiplier.max(1.0),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&IngestConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Written {
        attempts: u32,
    },
    DeadLettered {
        attempts: u32,
        kind: IngestErrorKind,
        error: String,
    },
}

impl IngestOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Written { attempts } | Self::DeadLettered { attempts, .. } => *attempts,
        }
    }
}

/// Transient or permanent, judged from the whole error chain.
pub(crate) fn classify_error(err: &anyhow::Error) -> IngestErrorKind {
    for cause in err.chain() {
        if let Some(ch) = cause.downcast_ref::<ClickHouseError>() {
            return if ch.is_permanent() {
                IngestErrorKind::Permanent
            } else {
                IngestErrorKind::Transient
            };
        }
        if let Some(SyncError::Ingestion { kind, .. }) = cause.downcast_ref::<SyncError>() {
            return *kind;
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return IngestErrorKind::Permanent;
        }
    }
    IngestErrorKind::Transient
}

pub struct IngestionClient {
    store: Arc<dyn EventStore>,
    policy: BackoffPolicy,
    timeout: Duration,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<Metrics>,
}

impl IngestionClient {
    pub fn new(
        store: Arc<dyn EventStore>,
        policy: BackoffPolicy,
        timeout: Duration,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            policy,
            timeout,
            dead_letters,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Writes `batch`, retrying transient failures. Returns `Err` only when
    /// cancelled during backoff or when a dead letter cannot be recorded; in
    /// both cases the rows are not accounted for and the caller must not
    /// advance its checkpoint.
    pub async fn ingest(
        &self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> SyncResult<IngestOutcome> {
        if batch.is_empty() {
            return Ok(IngestOutcome::Written { attempts: 0 });
        }

        let rows = batch.values();
        let token = batch.dedup_token();
        let table = batch.table;
        let mut attempt: u32 = 0;

        self.metrics.batch_opened(table);
        let result = loop {
            attempt += 1;
            let started = Instant::now();

            let err = match tokio::time::timeout(
                self.timeout,
                self.store.insert_rows(table, &rows, &token),
            )
            .await
            {
                Ok(Ok(())) => {
                    self.metrics
                        .last_flush_ms
                        .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    self.metrics
                        .rows_written
                        .fetch_add(rows.len() as u64, Ordering::Relaxed);
                    debug!(
                        table = %table,
                        rows = rows.len(),
                        attempt,
                        "batch written"
                    );
                    break Ok(IngestOutcome::Written { attempts: attempt });
                }
                Ok(Err(exc)) => exc,
                Err(_) => anyhow::Error::new(SyncError::Ingestion {
                    table: table.name().to_string(),
                    kind: IngestErrorKind::Transient,
                    message: format!("insert timed out after {:?}", self.timeout),
                }),
            };

            let kind = classify_error(&err);
            let message = format!("{err:#}");
            self.metrics.record_error(&message);
            match kind {
                IngestErrorKind::Transient => {
                    self.metrics.transient_failures.fetch_add(1, Ordering::Relaxed)
                }
                IngestErrorKind::Permanent => {
                    self.metrics.permanent_failures.fetch_add(1, Ordering::Relaxed)
                }
            };

            if kind == IngestErrorKind::Permanent || attempt >= self.policy.max_attempts {
                break self.dead_letter(batch, kind, &message, attempt);
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                table = %table,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "batch insert failed; retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(SyncError::Cancelled),
                _ = sleep(delay) => {}
            }
        };
        self.metrics.batch_closed(table);

        self.metrics
            .ingest_retries
            .fetch_add(u64::from(attempt.saturating_sub(1)), Ordering::Relaxed);
        result
    }

    fn dead_letter(
        &self,
        batch: &Batch,
        kind: IngestErrorKind,
        message: &str,
        attempts: u32,
    ) -> SyncResult<IngestOutcome> {
        let entry = DeadLetterEntry::from_batch(batch, kind, message, attempts);
        self.dead_letters.append(&entry)?;
        self.metrics
            .dead_letter_batches
            .fetch_add(1, Ordering::Relaxed);
        error!(
            table = %batch.table,
            rows = batch.len(),
            attempts,
            kind = %kind,
            "batch dead-lettered: {message}"
        );
        Ok(IngestOutcome::DeadLettered {
            attempts,
            kind,
            error: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchAssembler, BatchLimits};
    use crate::model::{RawRecord, Row, Table};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;

    #[derive(Clone, Copy)]
    enum Failure {
        Reset,
        BadInput,
        Hang,
    }

    struct ScriptedStore {
        script: Vec<Failure>,
        calls: AtomicU32,
    }

    impl ScriptedStore {
        fn new(script: Vec<Failure>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventStore for ScriptedStore {
        async fn insert_rows(&self, _: Table, _: &[Value], _: &str) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.script.get(call).copied() {
                None => Ok(()),
                Some(Failure::Reset) => Err(anyhow!("connection reset by peer")),
                Some(Failure::BadInput) => Err(anyhow::Error::new(ClickHouseError::Status {
                    status: 400,
                    body: "Code: 27. DB::Exception: Cannot parse input".to_string(),
                })
                .context("clickhouse insert failed")),
                Some(Failure::Hang) => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        async fn total_tokens(&self, _: &str) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn row_count(&self, _: Table) -> anyhow::Result<u64> {
            Ok(0)
        }
    }

    fn batch() -> Batch {
        let raw = RawRecord {
            source_file: "/logs/a.jsonl".to_string(),
            line_no: 1,
            start_offset: 0,
            end_offset: 10,
            text: String::new(),
        };
        let mut assembler = BatchAssembler::new(BatchLimits {
            max_rows: 10,
            max_bytes: usize::MAX,
            max_wait: Duration::from_secs(60),
            hard_cap_bytes: usize::MAX,
        });
        assembler.push(Row::new(
            Table::Messages,
            "k1".to_string(),
            json!({"dedup_key": "k1"}),
            &raw,
        ));
        assembler.flush_all().remove(0)
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    fn client(store: Arc<dyn EventStore>, policy: BackoffPolicy) -> (IngestionClient, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::default());
        (
            IngestionClient::new(
                store,
                policy,
                Duration::from_millis(200),
                Arc::new(DeadLetterQueue::in_memory()),
                metrics.clone(),
            ),
            metrics,
        )
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn classification_follows_clickhouse_status() {
        let server = anyhow::Error::new(ClickHouseError::Status {
            status: 503,
            body: "overloaded".to_string(),
        })
        .context("insert failed");
        assert_eq!(classify_error(&server), IngestErrorKind::Transient);

        let schema = anyhow::Error::new(ClickHouseError::Status {
            status: 500,
            body: "Code: 16. DB::Exception: No such column".to_string(),
        });
        assert_eq!(classify_error(&schema), IngestErrorKind::Permanent);

        assert_eq!(
            classify_error(&anyhow!("connection reset")),
            IngestErrorKind::Transient
        );
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let store = ScriptedStore::new(vec![Failure::Reset, Failure::Reset]);
        let (client, metrics) = client(store.clone(), fast_policy(5));

        let outcome = client
            .ingest(&batch(), &CancellationToken::new())
            .await
            .expect("ingest");
        assert_eq!(outcome, IngestOutcome::Written { attempts: 3 });
        assert_eq!(store.calls(), 3);
        assert_eq!(metrics.ingest_retries.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.rows_written.load(Ordering::Relaxed), 1);
        assert!(metrics.pending_batches().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_retry() {
        let store = ScriptedStore::new(vec![Failure::BadInput]);
        let (client, metrics) = client(store.clone(), fast_policy(5));

        let outcome = client
            .ingest(&batch(), &CancellationToken::new())
            .await
            .expect("ingest");
        assert!(matches!(
            outcome,
            IngestOutcome::DeadLettered {
                attempts: 1,
                kind: IngestErrorKind::Permanent,
                ..
            }
        ));
        assert_eq!(store.calls(), 1);
        assert_eq!(metrics.ingest_retries.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.dead_letter_batches.load(Ordering::Relaxed), 1);
        assert_eq!(client.dead_letters().len().expect("len"), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_as_transient() {
        let store = ScriptedStore::new(vec![Failure::Reset; 3]);
        let (client, metrics) = client(store.clone(), fast_policy(3));

        let outcome = client
            .ingest(&batch(), &CancellationToken::new())
            .await
            .expect("ingest");
        assert!(matches!(
            outcome,
            IngestOutcome::DeadLettered {
                attempts: 3,
                kind: IngestErrorKind::Transient,
                ..
            }
        ));
        assert_eq!(metrics.ingest_retries.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.error_counts().transient_ingest, 3);
    }

    #[tokio::test]
    async fn timeout_counts_as_transient_attempt() {
        let store = ScriptedStore::new(vec![Failure::Hang]);
        let (client, _) = client(store.clone(), fast_policy(3));

        let outcome = client
            .ingest(&batch(), &CancellationToken::new())
            .await
            .expect("ingest");
        assert_eq!(outcome, IngestOutcome::Written { attempts: 2 });
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_is_an_error() {
        let store = ScriptedStore::new(vec![Failure::Reset; 10]);
        let policy = BackoffPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
        };
        let (client, metrics) = client(store, policy);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = client
            .ingest(&batch(), &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(metrics.dead_letter_batches.load(Ordering::Relaxed), 0);
    }
}
