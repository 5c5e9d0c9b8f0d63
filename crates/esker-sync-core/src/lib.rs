pub mod batch;
pub mod checkpoint;
pub mod classify;
pub mod dead_letter;
pub mod discovery;
mod dispatch;
pub mod engine;
pub mod error;
mod heartbeat;
pub mod ingest;
pub mod metrics;
pub mod migration;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod tailer;
pub mod validate;

pub use crate::checkpoint::{migration_scope, CheckpointStore, LIVE_SCOPE};
pub use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use crate::engine::{CycleReport, FileFailure, SyncEngine, SyncHandle};
pub use crate::error::{IngestErrorKind, SyncError, SyncResult};
pub use crate::metrics::SyncStatus;
pub use crate::migration::{FileProgress, FileStatus, MigrationRun, MigrationStatus};
pub use crate::store::{ClickHouseEventStore, EventStore, MemoryEventStore};
pub use crate::validate::{ValidationReport, Validator};
pub use esker_config::WatchMode;
