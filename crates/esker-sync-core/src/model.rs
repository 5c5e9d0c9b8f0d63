use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Stable identity of a source file. The path keys checkpoints; device and
/// inode tell a rotated file apart from the one previously seen there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub path: String,
    pub device: u64,
    pub inode: u64,
}

impl FileId {
    pub fn from_metadata(path: &str, meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let (device, inode) = (meta.dev(), meta.ino());
        #[cfg(not(unix))]
        let (device, inode) = {
            let _ = meta;
            (0u64, 0u64)
        };

        Self {
            path: path.to_string(),
            device,
            inode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub id: FileId,
    pub size: u64,
    pub modified_unix_ms: u64,
    pub last_offset: u64,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scope: String,
    pub source_file: String,
    pub source_device: u64,
    pub source_inode: u64,
    pub source_generation: u32,
    pub last_offset: u64,
    pub last_line_no: u64,
    /// SHA-256 of the byte window ending at `last_offset`, empty at offset 0.
    pub fingerprint: String,
    pub updated_at_unix_ms: u64,
}

impl Checkpoint {
    pub fn initial(scope: &str, id: &FileId) -> Self {
        Self {
            scope: scope.to_string(),
            source_file: id.path.clone(),
            source_device: id.device,
            source_inode: id.inode,
            source_generation: 1,
            last_offset: 0,
            last_line_no: 0,
            fingerprint: String::new(),
            updated_at_unix_ms: 0,
        }
    }

    /// Rotation reset: back to the start of the file under a new generation.
    pub fn reset_for(&mut self, id: &FileId) {
        self.source_device = id.device;
        self.source_inode = id.inode;
        self.source_generation = self.source_generation.saturating_add(1).max(1);
        self.last_offset = 0;
        self.last_line_no = 0;
        self.fingerprint.clear();
    }

    pub fn identity_changed(&self, id: &FileId) -> bool {
        self.source_inode != 0
            && id.inode != 0
            && (self.source_inode != id.inode || self.source_device != id.device)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub source_file: String,
    /// 1-based line number within the current generation of the file.
    pub line_no: u64,
    pub start_offset: u64,
    /// Offset of the byte following the line's newline.
    pub end_offset: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    ToolUsage,
    FileAccess,
    Sessions,
    IngestErrors,
    IngestCheckpoints,
    MigrationLog,
    IngestHeartbeats,
}

impl Table {
    pub const EVENT_TABLES: [Table; 5] = [
        Table::Messages,
        Table::ToolUsage,
        Table::FileAccess,
        Table::Sessions,
        Table::IngestErrors,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::ToolUsage => "tool_usage",
            Self::FileAccess => "file_access",
            Self::Sessions => "sessions",
            Self::IngestErrors => "ingest_errors",
            Self::IngestCheckpoints => "ingest_checkpoints",
            Self::MigrationLog => "migration_log",
            Self::IngestHeartbeats => "ingest_heartbeats",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One destination row plus the position of the line that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub table: Table,
    pub dedup_key: String,
    pub value: Value,
    pub bytes: usize,
    pub source_start: u64,
    pub source_line_no: u64,
}

impl Row {
    pub fn new(table: Table, dedup_key: String, value: Value, raw: &RawRecord) -> Self {
        let bytes = serde_json::to_string(&value)
            .map(|text| text.len() + 1)
            .unwrap_or(0);
        Self {
            table,
            dedup_key,
            value,
            bytes,
            source_start: raw.start_offset,
            source_line_no: raw.line_no,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_write)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub session_id: String,
    pub uuid: String,
    pub parent_uuid: String,
    /// Record timestamp as written in the source.
    pub timestamp: String,
    /// `timestamp` formatted for DateTime64(3), epoch when unparseable.
    pub event_ts: String,
    pub content_hash: String,
    pub text_length: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub tool_use_id: String,
    pub is_error: bool,
    pub output_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedEvent {
    UserMessage {
        meta: EventMeta,
        text: String,
    },
    AssistantMessage {
        meta: EventMeta,
        text: String,
        model: String,
        usage: TokenUsage,
    },
    ToolInvocation {
        meta: EventMeta,
        text: String,
        model: String,
        usage: TokenUsage,
        calls: Vec<ToolCall>,
    },
    ToolResult {
        meta: EventMeta,
        outcomes: Vec<ToolOutcome>,
    },
    SessionSummary {
        meta: EventMeta,
        summary: String,
        leaf_uuid: String,
    },
    Unknown {
        meta: EventMeta,
        record_type: String,
        raw: Value,
    },
}

impl ClassifiedEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::UserMessage { meta, .. }
            | Self::AssistantMessage { meta, .. }
            | Self::ToolInvocation { meta, .. }
            | Self::ToolResult { meta, .. }
            | Self::SessionSummary { meta, .. }
            | Self::Unknown { meta, .. } => meta,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::ToolInvocation { .. } => "tool_invocation",
            Self::ToolResult { .. } => "tool_result",
            Self::SessionSummary { .. } => "session_summary",
            Self::Unknown { .. } => "unknown",
        }
    }

    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::AssistantMessage { usage, .. } | Self::ToolInvocation { usage, .. } => *usage,
            _ => TokenUsage::default(),
        }
    }
}
