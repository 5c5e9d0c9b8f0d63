use crate::model::Table;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use esker_clickhouse::{escape_literal, ClickHouseClient};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Destination of classified rows.
///
/// Inserts must be idempotent: a block resent with the same `dedup_token`, or
/// rows whose `dedup_key` is already stored, must not produce duplicates.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_rows(&self, table: Table, rows: &[Value], dedup_token: &str) -> Result<()>;

    /// Sum of `total_tokens` over messages whose source file starts with
    /// `source_prefix`.
    async fn total_tokens(&self, source_prefix: &str) -> Result<u64>;

    async fn row_count(&self, table: Table) -> Result<u64>;
}

pub struct ClickHouseEventStore {
    ch: ClickHouseClient,
}

impl ClickHouseEventStore {
    pub fn new(ch: ClickHouseClient) -> Self {
        Self { ch }
    }

    pub fn client(&self) -> &ClickHouseClient {
        &self.ch
    }

    fn table_ref(&self, table: Table) -> String {
        format!("{}.{}", self.ch.config().database, table.name())
    }

    async fn scalar(&self, query: &str) -> Result<u64> {
        let rows: Vec<Value> = self.ch.select(query, None).await?;
        let value = rows
            .first()
            .and_then(|row| row.get("value"))
            .ok_or_else(|| anyhow!("missing value in response to `{query}`"))?;
        parse_u64(value).ok_or_else(|| anyhow!("unexpected value {value} for `{query}`"))
    }
}

// ClickHouse quotes 64-bit integers in JSON output by default.
fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl EventStore for ClickHouseEventStore {
    async fn insert_rows(&self, table: Table, rows: &[Value], dedup_token: &str) -> Result<()> {
        let token = (!dedup_token.is_empty()).then_some(dedup_token);
        self.ch
            .insert_rows(table.name(), rows, token)
            .await
    }

    async fn total_tokens(&self, source_prefix: &str) -> Result<u64> {
        let query = format!(
            "SELECT toUInt64(sum(total_tokens)) AS value FROM {} FINAL \
             WHERE startsWith(source_file, {})",
            self.table_ref(Table::Messages),
            escape_literal(source_prefix)
        );
        self.scalar(&query).await
    }

    async fn row_count(&self, table: Table) -> Result<u64> {
        let query = format!(
            "SELECT toUInt64(count()) AS value FROM {} FINAL",
            self.table_ref(table)
        );
        self.scalar(&query).await
    }
}

#[derive(Default)]
struct MemoryTable {
    rows: Vec<Value>,
    keys: HashSet<String>,
}

/// In-process store with the same dedup semantics as the ClickHouse tables:
/// a row whose `dedup_key` was already stored replaces nothing and is dropped.
#[derive(Default)]
pub struct MemoryEventStore {
    tables: Mutex<BTreeMap<Table, MemoryTable>>,
    tokens: Mutex<HashSet<String>>,
    insert_calls: AtomicU64,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.tables
            .lock()
            .expect("memory store mutex poisoned")
            .get(&table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_rows(&self, table: Table, rows: &[Value], dedup_token: &str) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::Relaxed);
        if !dedup_token.is_empty() {
            let mut tokens = self.tokens.lock().expect("memory store mutex poisoned");
            if !tokens.insert(format!("{table}|{dedup_token}")) {
                return Ok(());
            }
        }

        let mut tables = self.tables.lock().expect("memory store mutex poisoned");
        let entry = tables.entry(table).or_default();
        for row in rows {
            match row.get("dedup_key").and_then(Value::as_str) {
                Some(key) if !key.is_empty() => {
                    if entry.keys.insert(key.to_string()) {
                        entry.rows.push(row.clone());
                    }
                }
                _ => entry.rows.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn total_tokens(&self, source_prefix: &str) -> Result<u64> {
        let tables = self.tables.lock().expect("memory store mutex poisoned");
        Ok(tables
            .get(&Table::Messages)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|row| {
                        row.get("source_file")
                            .and_then(Value::as_str)
                            .is_some_and(|file| file.starts_with(source_prefix))
                    })
                    .filter_map(|row| row.get("total_tokens").and_then(parse_u64))
                    .sum()
            })
            .unwrap_or(0))
    }

    async fn row_count(&self, table: Table) -> Result<u64> {
        let tables = self.tables.lock().expect("memory store mutex poisoned");
        Ok(tables.get(&table).map(|t| t.rows.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, routing::post, Router};
    use esker_config::ClickHouseConfig;
    use serde_json::json;
    use std::collections::HashMap;

    #[tokio::test]
    async fn memory_store_drops_duplicate_keys_and_tokens() {
        let store = MemoryEventStore::new();
        let rows = vec![
            json!({"dedup_key": "a", "total_tokens": 5, "source_file": "/logs/p/a.jsonl"}),
            json!({"dedup_key": "b", "total_tokens": "7", "source_file": "/logs/p/a.jsonl"}),
        ];
        store
            .insert_rows(Table::Messages, &rows, "tok-1")
            .await
            .expect("insert");
        store
            .insert_rows(Table::Messages, &rows, "tok-1")
            .await
            .expect("resend");
        store
            .insert_rows(Table::Messages, &rows[..1], "tok-2")
            .await
            .expect("overlap");

        assert_eq!(store.row_count(Table::Messages).await.expect("count"), 2);
        assert_eq!(store.total_tokens("/logs/").await.expect("tokens"), 12);
        assert_eq!(store.total_tokens("/other/").await.expect("tokens"), 0);
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn clickhouse_store_reads_quoted_scalars() {
        async fn handler(Query(params): Query<HashMap<String, String>>) -> String {
            let query = params.get("query").cloned().unwrap_or_default();
            assert!(query.contains("FINAL"), "query without FINAL: {query}");
            r#"{"meta":[],"data":[{"value":"1234"}],"rows":1}"#.to_string()
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock clickhouse");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let app = Router::new().route("/", post(handler));
            axum::serve(listener, app).await.expect("serve mock");
        });

        let cfg = ClickHouseConfig {
            url: format!("http://{addr}"),
            ..ClickHouseConfig::default()
        };
        let store = ClickHouseEventStore::new(ClickHouseClient::new(cfg).expect("client"));
        assert_eq!(store.total_tokens("/logs/").await.expect("tokens"), 1234);
        assert_eq!(store.row_count(Table::Messages).await.expect("count"), 1234);
    }
}
