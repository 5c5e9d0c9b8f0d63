use crate::error::{SyncError, SyncResult};
use crate::model::{
    ClassifiedEvent, EventMeta, RawRecord, Row, Table, TokenUsage, ToolCall, ToolOutcome,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;

const PREVIEW_LIMIT: usize = 320;
const HASH_PREFIX_CHARS: usize = 256;
const ERROR_TEXT_LIMIT: usize = 2_000;
const RAW_FRAGMENT_LIMIT: usize = 20_000;
const UNPARSEABLE_EVENT_TS: &str = "1970-01-01 00:00:00.000";
const MAX_PENDING_INVOCATIONS: usize = 4_096;

const PATH_KEYS: [&str; 3] = ["file_path", "path", "notebook_path"];

/// USD per million tokens: (model prefix, input, output, cache read, cache write).
const MODEL_PRICES: &[(&str, f64, f64, f64, f64)] = &[
    ("claude-opus-4", 15.0, 75.0, 1.5, 18.75),
    ("claude-3-opus", 15.0, 75.0, 1.5, 18.75),
    ("claude-sonnet-4", 3.0, 15.0, 0.3, 3.75),
    ("claude-3-7-sonnet", 3.0, 15.0, 0.3, 3.75),
    ("claude-3-5-sonnet", 3.0, 15.0, 0.3, 3.75),
    ("claude-haiku-4", 1.0, 5.0, 0.1, 1.25),
    ("claude-3-5-haiku", 0.8, 4.0, 0.08, 1.0),
    ("claude-3-haiku", 0.25, 1.25, 0.03, 0.3),
];

fn session_id_re() -> &'static Regex {
    static SESSION_ID_RE: OnceLock<Regex> = OnceLock::new();
    SESSION_ID_RE.get_or_init(|| {
        Regex::new(
            r"([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})$",
        )
        .expect("valid session id regex")
    })
}

fn to_str(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn to_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

fn to_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(v)) => *v,
        Some(Value::Number(v)) => v.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => {
            let lower = s.to_ascii_lowercase();
            lower == "true" || lower == "1"
        }
        _ => false,
    }
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        input.chars().take(max_chars).collect()
    }
}

fn sha256_hex(material: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn canonicalize_model(raw_model: &str) -> String {
    raw_model.trim().to_ascii_lowercase().replace(' ', "-")
}

pub fn estimate_cost_usd(model: &str, usage: &TokenUsage) -> f64 {
    let Some((_, input, output, cache_read, cache_write)) = MODEL_PRICES
        .iter()
        .find(|(prefix, ..)| model.starts_with(prefix))
    else {
        return 0.0;
    };

    (usage.input as f64 * input
        + usage.output as f64 * output
        + usage.cache_read as f64 * cache_read
        + usage.cache_write as f64 * cache_write)
        / 1_000_000.0
}

pub fn infer_session_id_from_file(source_file: &str) -> String {
    let stem = std::path::Path::new(source_file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    session_id_re()
        .captures(stem)
        .and_then(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .unwrap_or_default()
}

fn parse_record_ts(record_ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(record_ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn format_event_ts(record_ts: &str) -> String {
    parse_record_ts(record_ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| UNPARSEABLE_EVENT_TS.to_string())
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Dedup key of a record. Stable across byte-identical copies of a file and
/// blind to whitespace-only differences in the text.
pub fn content_hash(kind: &str, session_id: &str, uuid: &str, timestamp: &str, text: &str) -> String {
    let normalized = normalize_whitespace(text);
    let length = normalized.chars().count();
    let prefix: String = normalized.chars().take(HASH_PREFIX_CHARS).collect();
    sha256_hex(&format!(
        "{kind}|{session_id}|{uuid}|{timestamp}|{length}|{prefix}"
    ))
}

fn extract_message_text(content: &Value) -> String {
    fn walk(node: &Value, out: &mut Vec<String>) {
        match node {
            Value::String(s) => {
                if !s.trim().is_empty() {
                    out.push(s.clone());
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, out);
                }
            }
            Value::Object(map) => {
                if map.get("type").and_then(Value::as_str) == Some("tool_use") {
                    return;
                }
                for key in ["text", "thinking", "summary"] {
                    if let Some(Value::String(s)) = map.get(key) {
                        if !s.trim().is_empty() {
                            out.push(s.clone());
                        }
                    }
                }
                if let Some(value) = map.get("content") {
                    walk(value, out);
                }
            }
            _ => {}
        }
    }

    let mut chunks = Vec::<String>::new();
    walk(content, &mut chunks);
    chunks.join("\n")
}

fn block_type(block: &Value) -> &str {
    block.get("type").and_then(Value::as_str).unwrap_or_default()
}

fn content_has_block(content: &Value, wanted: &str) -> bool {
    matches!(content, Value::Array(items) if items.iter().any(|item| block_type(item) == wanted))
}

fn carries_tool_result(record: &Value, content: &Value) -> bool {
    record.get("toolUseResult").is_some() || content_has_block(content, "tool_result")
}

fn tool_calls(content: &Value) -> Vec<ToolCall> {
    let Value::Array(items) = content else {
        return Vec::new();
    };

    items
        .iter()
        .filter(|item| block_type(item) == "tool_use")
        .map(|item| {
            let input = item.get("input").cloned().unwrap_or(Value::Null);
            let paths = PATH_KEYS
                .iter()
                .filter_map(|key| input.get(*key).and_then(Value::as_str))
                .filter(|path| !path.trim().is_empty())
                .map(str::to_string)
                .collect();
            ToolCall {
                id: to_str(item.get("id")),
                name: to_str(item.get("name")),
                input,
                paths,
            }
        })
        .collect()
}

fn tool_outcomes(record: &Value, top_type: &str, content: &Value) -> Vec<ToolOutcome> {
    let mut outcomes = Vec::new();

    if let Value::Array(items) = content {
        for item in items.iter().filter(|item| block_type(item) == "tool_result") {
            outcomes.push(ToolOutcome {
                tool_use_id: to_str(item.get("tool_use_id")),
                is_error: to_bool(item.get("is_error")),
                output_text: extract_message_text(item.get("content").unwrap_or(&Value::Null)),
            });
        }
    }

    if outcomes.is_empty() && top_type == "tool_result" {
        let tool_use_id = match to_str(record.get("tool_use_id")) {
            id if id.is_empty() => to_str(record.get("toolUseId")),
            id => id,
        };
        outcomes.push(ToolOutcome {
            tool_use_id,
            is_error: to_bool(record.get("is_error")),
            output_text: extract_message_text(record.get("content").unwrap_or(&Value::Null)),
        });
    }

    if outcomes.is_empty() {
        if let Some(result) = record.get("toolUseResult") {
            outcomes.push(ToolOutcome {
                tool_use_id: to_str(record.get("sourceToolUseID")),
                is_error: false,
                output_text: match result {
                    Value::String(s) => s.clone(),
                    other => compact_json(other),
                },
            });
        }
    }

    outcomes
}

fn token_usage(message: &Value) -> TokenUsage {
    let usage = message.get("usage").unwrap_or(&Value::Null);
    TokenUsage {
        input: to_u64(usage.get("input_tokens")),
        output: to_u64(usage.get("output_tokens")),
        cache_read: to_u64(usage.get("cache_read_input_tokens")),
        cache_write: to_u64(usage.get("cache_creation_input_tokens")),
    }
}

fn file_operation(tool_name: &str) -> &'static str {
    match tool_name {
        "Read" | "NotebookRead" => "read",
        "Write" => "write",
        "Edit" | "MultiEdit" | "NotebookEdit" => "edit",
        "Glob" | "Grep" | "LS" => "search",
        _ => "other",
    }
}

fn written_bytes(call: &ToolCall) -> u64 {
    ["content", "new_string", "new_source"]
        .iter()
        .find_map(|key| call.input.get(*key).and_then(Value::as_str))
        .map(|text| text.len() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct PendingInvocation {
    name: String,
    started: Option<DateTime<Utc>>,
}

/// Tool invocations awaiting their result, carried between tail cycles of the
/// same file so that a result appended later still finds its tool name.
#[derive(Debug, Clone, Default)]
pub struct ToolCorrelation {
    pending: HashMap<String, PendingInvocation>,
}

impl ToolCorrelation {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Classifier {
    correlation: ToolCorrelation,
}

/// Stateless classification of a single line.
pub fn classify_line(raw: &RawRecord) -> SyncResult<ClassifiedEvent> {
    Classifier::default().classify(raw)
}

impl Classifier {
    pub fn with_correlation(correlation: ToolCorrelation) -> Self {
        Self { correlation }
    }

    pub fn into_correlation(self) -> ToolCorrelation {
        self.correlation
    }

    pub fn classify(&mut self, raw: &RawRecord) -> SyncResult<ClassifiedEvent> {
        let record: Value = serde_json::from_str(&raw.text).map_err(|exc| SyncError::Parse {
            path: raw.source_file.clone(),
            line_no: raw.line_no,
            message: exc.to_string(),
        })?;
        if !record.is_object() {
            return Err(SyncError::Parse {
                path: raw.source_file.clone(),
                line_no: raw.line_no,
                message: "expected JSON object".to_string(),
            });
        }

        let top_type = to_str(record.get("type"));
        let message = record.get("message").cloned().unwrap_or(Value::Null);
        let role = to_str(message.get("role"));
        let content = message.get("content").cloned().unwrap_or(Value::Null);

        let session_id = match to_str(record.get("sessionId")) {
            id if id.is_empty() => infer_session_id_from_file(&raw.source_file),
            id => id,
        };
        let timestamp = to_str(record.get("timestamp"));

        let meta = |kind: &str, uuid: String, hash_text: &str, text_length: usize| EventMeta {
            content_hash: content_hash(kind, &session_id, &uuid, &timestamp, hash_text),
            session_id: session_id.clone(),
            uuid,
            parent_uuid: to_str(record.get("parentUuid")),
            timestamp: timestamp.clone(),
            event_ts: format_event_ts(&timestamp),
            text_length,
        };
        let uuid = to_str(record.get("uuid"));

        if top_type == "summary" {
            let summary = to_str(record.get("summary"));
            let leaf_uuid = to_str(record.get("leafUuid"));
            let key = if uuid.is_empty() { leaf_uuid.clone() } else { uuid };
            return Ok(ClassifiedEvent::SessionSummary {
                meta: meta("session_summary", key, &summary, summary.chars().count()),
                summary,
                leaf_uuid,
            });
        }

        let is_user = top_type == "user" || role == "user";
        if is_user && !carries_tool_result(&record, &content) {
            let text = extract_message_text(&content);
            return Ok(ClassifiedEvent::UserMessage {
                meta: meta("user_message", uuid, &text, text.chars().count()),
                text,
            });
        }

        if top_type == "assistant" || role == "assistant" {
            let text = extract_message_text(&content);
            let model = canonicalize_model(&to_str(message.get("model")));
            let usage = token_usage(&message);
            let calls = tool_calls(&content);

            if calls.is_empty() {
                return Ok(ClassifiedEvent::AssistantMessage {
                    meta: meta("assistant_message", uuid, &text, text.chars().count()),
                    text,
                    model,
                    usage,
                });
            }

            let mut hash_text = text.clone();
            for call in &calls {
                hash_text.push('\n');
                hash_text.push_str(&call.name);
                hash_text.push(' ');
                hash_text.push_str(&compact_json(&call.input));
            }
            let meta = meta("tool_invocation", uuid, &hash_text, text.chars().count());

            let started = parse_record_ts(&meta.timestamp);
            if self.correlation.pending.len() >= MAX_PENDING_INVOCATIONS {
                self.correlation.pending.clear();
            }
            for call in calls.iter().filter(|call| !call.id.is_empty()) {
                self.correlation.pending.insert(
                    call.id.clone(),
                    PendingInvocation {
                        name: call.name.clone(),
                        started,
                    },
                );
            }

            return Ok(ClassifiedEvent::ToolInvocation {
                meta,
                text,
                model,
                usage,
                calls,
            });
        }

        if top_type == "tool_result" || carries_tool_result(&record, &content) {
            let outcomes = tool_outcomes(&record, &top_type, &content);
            let hash_text = outcomes
                .iter()
                .map(|o| format!("{} {}", o.tool_use_id, o.output_text))
                .collect::<Vec<_>>()
                .join("\n");
            let text_length = outcomes.iter().map(|o| o.output_text.chars().count()).sum();
            return Ok(ClassifiedEvent::ToolResult {
                meta: meta("tool_result", uuid, &hash_text, text_length),
                outcomes,
            });
        }

        let raw_json = compact_json(&record);
        Ok(ClassifiedEvent::Unknown {
            meta: meta("unknown", uuid, &raw_json, raw_json.chars().count()),
            record_type: top_type,
            raw: record,
        })
    }

    /// Destination rows for one classified event.
    pub fn rows(&mut self, event: &ClassifiedEvent, raw: &RawRecord) -> Vec<Row> {
        match event {
            ClassifiedEvent::UserMessage { meta, text } => {
                vec![message_row(meta, raw, "user_message", "user", "", &TokenUsage::default(), text, 0)]
            }
            ClassifiedEvent::AssistantMessage {
                meta,
                text,
                model,
                usage,
            } => vec![message_row(
                meta,
                raw,
                "assistant_message",
                "assistant",
                model,
                usage,
                text,
                0,
            )],
            ClassifiedEvent::ToolInvocation {
                meta,
                text,
                model,
                usage,
                calls,
            } => {
                let mut rows = vec![message_row(
                    meta,
                    raw,
                    "tool_invocation",
                    "assistant",
                    model,
                    usage,
                    text,
                    calls.len(),
                )];
                for call in calls {
                    for path in &call.paths {
                        let dedup_key = sha256_hex(&format!(
                            "{}|file_access|{}|{}",
                            meta.content_hash, call.id, path
                        ));
                        let value = json!({
                            "dedup_key": dedup_key,
                            "session_id": meta.session_id,
                            "message_id": meta.uuid,
                            "event_ts": meta.event_ts,
                            "path": path,
                            "operation": file_operation(&call.name),
                            "tool_name": call.name,
                            "size_bytes": written_bytes(call),
                        });
                        rows.push(Row::new(Table::FileAccess, dedup_key, value, raw));
                    }
                }
                rows
            }
            ClassifiedEvent::ToolResult { meta, outcomes } => {
                let finished = parse_record_ts(&meta.timestamp);
                outcomes
                    .iter()
                    .map(|outcome| {
                        let invocation = self.correlation.pending.remove(&outcome.tool_use_id);
                        let tool_name = invocation
                            .as_ref()
                            .map(|inv| inv.name.clone())
                            .unwrap_or_default();
                        let duration_ms = match (invocation.and_then(|inv| inv.started), finished) {
                            (Some(start), Some(end)) => {
                                end.signed_duration_since(start).num_milliseconds().max(0) as u64
                            }
                            _ => 0,
                        };
                        let error_text = if outcome.is_error {
                            truncate_chars(&outcome.output_text, ERROR_TEXT_LIMIT)
                        } else {
                            String::new()
                        };
                        let dedup_key = sha256_hex(&format!(
                            "{}|tool_usage|{}",
                            meta.content_hash, outcome.tool_use_id
                        ));
                        let value = json!({
                            "dedup_key": dedup_key,
                            "tool_use_id": outcome.tool_use_id,
                            "tool_name": tool_name,
                            "session_id": meta.session_id,
                            "message_id": meta.uuid,
                            "event_ts": meta.event_ts,
                            "success": u8::from(!outcome.is_error),
                            "duration_ms": duration_ms,
                            "error_text": error_text,
                            "output_bytes": outcome.output_text.len().min(u32::MAX as usize) as u32,
                            "source_file": raw.source_file,
                        });
                        Row::new(Table::ToolUsage, dedup_key, value, raw)
                    })
                    .collect()
            }
            ClassifiedEvent::SessionSummary {
                meta,
                summary,
                leaf_uuid,
            } => {
                let directory = std::path::Path::new(&raw.source_file)
                    .parent()
                    .map(|dir| dir.to_string_lossy().to_string())
                    .unwrap_or_default();
                let value = json!({
                    "dedup_key": meta.content_hash,
                    "session_id": meta.session_id,
                    "directory": directory,
                    "summary": summary,
                    "leaf_uuid": leaf_uuid,
                    "event_ts": meta.event_ts,
                    "source_file": raw.source_file,
                });
                vec![Row::new(Table::Sessions, meta.content_hash.clone(), value, raw)]
            }
            ClassifiedEvent::Unknown {
                meta, record_type, ..
            } => vec![message_row(
                meta,
                raw,
                record_type,
                "",
                "",
                &TokenUsage::default(),
                "",
                0,
            )],
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn message_row(
    meta: &EventMeta,
    raw: &RawRecord,
    message_type: &str,
    role: &str,
    model: &str,
    usage: &TokenUsage,
    text: &str,
    tool_count: usize,
) -> Row {
    let clamp = |value: u64| value.min(u32::MAX as u64) as u32;
    let value = json!({
        "dedup_key": meta.content_hash,
        "message_id": meta.uuid,
        "session_id": meta.session_id,
        "parent_id": meta.parent_uuid,
        "event_ts": meta.event_ts,
        "message_type": message_type,
        "role": role,
        "model": model,
        "content_length": meta.text_length.min(u32::MAX as usize) as u32,
        "input_tokens": clamp(usage.input),
        "output_tokens": clamp(usage.output),
        "cache_read_tokens": clamp(usage.cache_read),
        "cache_write_tokens": clamp(usage.cache_write),
        "total_tokens": usage.total(),
        "cost_usd": estimate_cost_usd(model, usage),
        "tool_count": tool_count.min(u16::MAX as usize) as u16,
        "text_preview": truncate_chars(text, PREVIEW_LIMIT),
        "source_file": raw.source_file,
        "source_line_no": raw.line_no,
        "source_offset": raw.start_offset,
    });
    Row::new(Table::Messages, meta.content_hash.clone(), value, raw)
}

/// `ingest_errors` row for a line that could not be classified.
pub fn error_row(raw: &RawRecord, error_kind: &str, error_text: &str) -> Row {
    let dedup_key = sha256_hex(&format!(
        "ingest_error|{}|{}|{}|{}",
        raw.source_file,
        raw.line_no,
        raw.start_offset,
        sha256_hex(&raw.text)
    ));
    let value = json!({
        "dedup_key": dedup_key,
        "source_file": raw.source_file,
        "source_line_no": raw.line_no,
        "source_offset": raw.start_offset,
        "error_kind": error_kind,
        "error_text": error_text,
        "raw_fragment": truncate_chars(&raw.text, RAW_FRAGMENT_LIMIT),
    });
    Row::new(Table::IngestErrors, dedup_key, value, raw)
}
