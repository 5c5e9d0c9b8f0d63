use crate::classify::Classifier;
use crate::error::{SyncError, SyncResult};
use crate::ingest::classify_error;
use crate::model::Table;
use crate::store::EventStore;
use crate::tailer::Tailer;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub files: usize,
    pub records: u64,
    pub unique_records: u64,
    pub parse_errors: u64,
    pub source_tokens: u64,
    pub store_tokens: u64,
    pub variance: f64,
    pub tolerance: f64,
    pub within_tolerance: bool,
    pub checked_at: String,
}

impl ValidationReport {
    pub fn into_result(self) -> SyncResult<Self> {
        if self.within_tolerance {
            return Ok(self);
        }
        Err(SyncError::Validation {
            source_total: self.source_tokens,
            store_total: self.store_tokens,
            variance: self.variance,
            tolerance: self.tolerance,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceTotals {
    pub files: usize,
    pub records: u64,
    pub unique_records: u64,
    pub parse_errors: u64,
    pub tokens: u64,
}

pub fn variance(source_total: u64, store_total: u64) -> f64 {
    source_total.abs_diff(store_total) as f64 / source_total.max(1) as f64
}

/// Prefix matching `root` and everything below it, but not its siblings.
pub(crate) fn source_prefix(root: &str) -> String {
    if root.ends_with('/') {
        root.to_string()
    } else {
        format!("{root}/")
    }
}

/// Recounts tokens straight from the source files, counting each content
/// hash once the way the store keeps each dedup key once.
pub fn source_totals(files: &[String]) -> SyncResult<SourceTotals> {
    let mut totals = SourceTotals::default();
    let mut seen = HashSet::<String>::new();

    for path in files {
        let tailer = match Tailer::open(path, 0, 0) {
            Ok(tailer) => tailer,
            Err(SyncError::FileAccess { source, .. }) if source.kind() == ErrorKind::NotFound => {
                warn!(file = %path, "file vanished before validation; skipped");
                continue;
            }
            Err(exc) => return Err(exc),
        };
        totals.files += 1;

        let mut classifier = Classifier::default();
        for item in tailer {
            let raw = item?;
            match classifier.classify(&raw) {
                Ok(event) => {
                    totals.records += 1;
                    if seen.insert(event.meta().content_hash.clone()) {
                        totals.unique_records += 1;
                        totals.tokens = totals.tokens.saturating_add(event.usage().total());
                    }
                }
                Err(SyncError::Parse { .. }) => totals.parse_errors += 1,
                Err(exc) => return Err(exc),
            }
        }
    }

    Ok(totals)
}

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    tolerance: f64,
}

impl Validator {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.max(0.0),
        }
    }

    /// Source and store totals for `files` under `root`, without judging them.
    pub async fn measure(
        &self,
        files: &[String],
        store: &dyn EventStore,
        root: &str,
    ) -> SyncResult<ValidationReport> {
        let source = source_totals(files)?;
        let store_tokens = store
            .total_tokens(&source_prefix(root))
            .await
            .map_err(|exc| SyncError::Ingestion {
                table: Table::Messages.name().to_string(),
                kind: classify_error(&exc),
                message: format!("{exc:#}"),
            })?;

        let variance = variance(source.tokens, store_tokens);
        let report = ValidationReport {
            files: source.files,
            records: source.records,
            unique_records: source.unique_records,
            parse_errors: source.parse_errors,
            source_tokens: source.tokens,
            store_tokens,
            variance,
            tolerance: self.tolerance,
            within_tolerance: variance <= self.tolerance,
            checked_at: Utc::now().to_rfc3339(),
        };
        info!(
            root,
            source_tokens = report.source_tokens,
            store_tokens = report.store_tokens,
            variance = report.variance,
            "validation measured"
        );
        Ok(report)
    }

    /// Like `measure`, but a variance above the tolerance is an error.
    pub async fn reconcile(
        &self,
        files: &[String],
        store: &dyn EventStore,
        root: &str,
    ) -> SyncResult<ValidationReport> {
        self.measure(files, store, root).await?.into_result()
    }
}
