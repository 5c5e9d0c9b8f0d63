use crate::model::{Row, Table};
use esker_config::SyncConfig;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
    pub max_wait: Duration,
    pub hard_cap_bytes: usize,
}

impl BatchLimits {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_rows: config.batch_max_rows.max(1),
            max_bytes: config.batch_max_bytes.max(1),
            max_wait: Duration::from_millis(config.batch_max_wait_ms),
            hard_cap_bytes: config.batch_hard_cap_bytes.max(config.batch_max_bytes),
        }
    }
}

/// Rows for one destination table, written atomically.
#[derive(Debug, Clone)]
pub struct Batch {
    pub table: Table,
    pub rows: Vec<Row>,
    pub bytes: usize,
    pub created_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn values(&self) -> Vec<Value> {
        self.rows.iter().map(|row| row.value.clone()).collect()
    }

    /// Token derived from the row keys, identical when the same rows are
    /// resent after a crash or a retry.
    pub fn dedup_token(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.table.name().as_bytes());
        for row in &self.rows {
            hasher.update(b"|");
            hasher.update(row.dedup_key.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug)]
struct Group {
    rows: Vec<Row>,
    bytes: usize,
    opened_at: Instant,
}

impl Group {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            bytes: 0,
            opened_at: Instant::now(),
        }
    }

    fn into_batch(self, table: Table) -> Batch {
        Batch {
            table,
            rows: self.rows,
            bytes: self.bytes,
            created_at: self.opened_at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LineMark {
    line_no_before: u64,
    outstanding: usize,
}

/// Groups rows by destination table and tracks which source lines still
/// have rows that are not durably written.
#[derive(Debug)]
pub struct BatchAssembler {
    limits: BatchLimits,
    groups: BTreeMap<Table, Group>,
    lines: BTreeMap<u64, LineMark>,
}

impl BatchAssembler {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            groups: BTreeMap::new(),
            lines: BTreeMap::new(),
        }
    }

    pub fn buffered_rows(&self) -> usize {
        self.groups.values().map(|g| g.rows.len()).sum()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.groups.values().map(|g| g.bytes).sum()
    }

    /// Adds a row and returns the batches that became ready. The caller must
    /// ingest them before reading further lines.
    pub fn push(&mut self, row: Row) -> Vec<Batch> {
        let mut ready = Vec::new();
        let table = row.table;

        let mark = self.lines.entry(row.source_start).or_insert(LineMark {
            line_no_before: row.source_line_no.saturating_sub(1),
            outstanding: 0,
        });
        mark.outstanding += 1;

        if let Some(group) = self.groups.get(&table) {
            if !group.rows.is_empty()
                && group.bytes.saturating_add(row.bytes) > self.limits.hard_cap_bytes
            {
                if let Some(group) = self.groups.remove(&table) {
                    ready.push(group.into_batch(table));
                }
            }
        }

        let group = self.groups.entry(table).or_insert_with(Group::new);
        group.bytes = group.bytes.saturating_add(row.bytes);
        group.rows.push(row);

        if group.rows.len() >= self.limits.max_rows || group.bytes >= self.limits.max_bytes {
            if let Some(group) = self.groups.remove(&table) {
                ready.push(group.into_batch(table));
            }
        }
        ready
    }

    /// Groups whose first row has waited at least `max_wait`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Batch> {
        let expired: Vec<Table> = self
            .groups
            .iter()
            .filter(|(_, group)| now.duration_since(group.opened_at) >= self.limits.max_wait)
            .map(|(table, _)| *table)
            .collect();

        expired
            .into_iter()
            .filter_map(|table| self.groups.remove(&table).map(|g| g.into_batch(table)))
            .collect()
    }

    pub fn flush_all(&mut self) -> Vec<Batch> {
        std::mem::take(&mut self.groups)
            .into_iter()
            .map(|(table, group)| group.into_batch(table))
            .collect()
    }

    /// Marks a batch as written or dead-lettered.
    pub fn complete(&mut self, batch: &Batch) {
        for row in &batch.rows {
            if let Some(mark) = self.lines.get_mut(&row.source_start) {
                mark.outstanding = mark.outstanding.saturating_sub(1);
                if mark.outstanding == 0 {
                    self.lines.remove(&row.source_start);
                }
            }
        }
    }

    /// Offset and line number every byte before which is fully ingested,
    /// given the position the reader has processed up to.
    pub fn safe_watermark(&self, processed_offset: u64, processed_line_no: u64) -> (u64, u64) {
        match self.lines.iter().next() {
            Some((start, mark)) => (*start, mark.line_no_before),
            None => (processed_offset, processed_line_no),
        }
    }
}
