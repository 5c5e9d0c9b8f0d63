use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestErrorKind {
    /// Network, timeout or overload; resending the batch may succeed.
    Transient,
    /// Schema or type mismatch; resending the same rows never succeeds.
    Permanent,
}

impl fmt::Display for IngestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot access {path}: {source}")]
    FileAccess {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed line {line_no} in {path}: {message}")]
    Parse {
        path: String,
        line_no: u64,
        message: String,
    },
    #[error("{kind} ingestion failure on {table}: {message}")]
    Ingestion {
        table: String,
        kind: IngestErrorKind,
        message: String,
    },
    #[error(
        "store total {store_total} diverges from source total {source_total} \
         (variance {variance:.6} > tolerance {tolerance})"
    )]
    Validation {
        source_total: u64,
        store_total: u64,
        variance: f64,
        tolerance: f64,
    },
    #[error("resource exhausted: {0}")]
    Resource(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("checkpoint store: {0}")]
    Checkpoint(String),
    #[error("no migration run with id {0}")]
    UnknownRun(String),
    #[error("cancelled")]
    Cancelled,
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

// EMFILE, ENFILE, ENOMEM, ENOSPC, EDQUOT
const RESOURCE_OS_ERRORS: &[i32] = &[24, 23, 12, 28, 122];

impl SyncError {
    /// Maps an I/O failure on `path` to the taxonomy. Running out of file
    /// handles, memory or disk is a resource condition, everything else is
    /// a file access problem local to that file.
    pub fn from_io(path: &str, source: std::io::Error) -> Self {
        if source
            .raw_os_error()
            .is_some_and(|code| RESOURCE_OS_ERRORS.contains(&code))
            || source.kind() == std::io::ErrorKind::OutOfMemory
        {
            return Self::Resource(format!("{path}: {source}"));
        }

        Self::FileAccess {
            path: path.to_string(),
            source,
        }
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Resource(_))
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::FileAccess { .. } => "file_access",
            Self::Parse { .. } => "parse",
            Self::Ingestion { .. } => "ingestion",
            Self::Validation { .. } => "validation",
            Self::Resource(_) => "resource",
            Self::Config(_) => "config",
            Self::Checkpoint(_) => "checkpoint",
            Self::UnknownRun(_) => "unknown_run",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_maps_to_resource() {
        let err = SyncError::from_io("/tmp/a.jsonl", std::io::Error::from_raw_os_error(28));
        assert!(err.is_resource());
    }

    #[test]
    fn missing_file_maps_to_file_access() {
        let err = SyncError::from_io(
            "/tmp/a.jsonl",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind_label(), "file_access");
        assert!(err.to_string().contains("/tmp/a.jsonl"));
    }
}
