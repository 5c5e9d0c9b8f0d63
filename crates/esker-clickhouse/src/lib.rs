use anyhow::{anyhow, bail, Context, Result};
use esker_config::ClickHouseConfig;
use reqwest::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    Client, Url,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Server exception codes that mean the payload or schema is wrong; resending
/// the same rows can never succeed.
const PERMANENT_SERVER_CODES: &[u32] = &[
    6,   // CANNOT_PARSE_TEXT
    16,  // NO_SUCH_COLUMN_IN_TABLE
    26,  // CANNOT_PARSE_QUOTED_STRING
    27,  // CANNOT_PARSE_INPUT_ASSERTION_FAILED
    41,  // CANNOT_PARSE_DATETIME
    53,  // TYPE_MISMATCH
    60,  // UNKNOWN_TABLE
    62,  // SYNTAX_ERROR
    70,  // CANNOT_CONVERT_TYPE
    81,  // UNKNOWN_DATABASE
    117, // INCORRECT_DATA
];

/// Tables `db doctor` expects once every bundled migration is applied.
const REQUIRED_TABLES: &[&str] = &[
    "messages",
    "tool_usage",
    "file_access",
    "sessions",
    "ingest_errors",
    "ingest_checkpoints",
    "migration_log",
    "ingest_heartbeats",
    "schema_migrations",
];

#[derive(Debug, Error)]
pub enum ClickHouseError {
    #[error("clickhouse transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("clickhouse returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl ClickHouseError {
    /// Parses the `Code: NN.` prefix ClickHouse puts on exception bodies.
    pub fn server_code(&self) -> Option<u32> {
        let Self::Status { body, .. } = self else {
            return None;
        };
        let rest = body.trim_start().strip_prefix("Code:")?.trim_start();
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }

    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Transport(_) => false,
            Self::Status { status, .. } => {
                let schema_fault = self
                    .server_code()
                    .is_some_and(|code| PERMANENT_SERVER_CODES.contains(&code));
                schema_fault || ((400..500).contains(status) && !matches!(*status, 408 | 429))
            }
        }
    }
}

/// One statement sent over the HTTP interface.
#[derive(Debug, Default)]
pub struct Statement<'a> {
    sql: &'a str,
    body: Vec<u8>,
    database: Option<&'a str>,
    format: Option<&'a str>,
    async_insert: bool,
    settings: Vec<(&'a str, &'a str)>,
}

impl<'a> Statement<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            ..Self::default()
        }
    }

    pub fn database(mut self, database: &'a str) -> Self {
        self.database = Some(database);
        self
    }

    pub fn format(mut self, format: &'a str) -> Self {
        self.format = Some(format);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Honors `clickhouse.async_insert` for this statement.
    pub fn async_insert(mut self) -> Self {
        self.async_insert = true;
        self
    }

    pub fn setting(mut self, key: &'a str, value: &'a str) -> Self {
        self.settings.push((key, value));
        self
    }
}

#[derive(Deserialize)]
struct JsonEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: &'static str,
    pub name: &'static str,
    pub sql: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub clickhouse_healthy: bool,
    pub clickhouse_version: Option<String>,
    pub database: String,
    pub database_exists: bool,
    pub applied_migrations: Vec<String>,
    pub pending_migrations: Vec<String>,
    pub missing_tables: Vec<String>,
    pub errors: Vec<String>,
}

impl DoctorReport {
    fn new(database: &str) -> Self {
        Self {
            clickhouse_healthy: false,
            clickhouse_version: None,
            database: database.to_string(),
            database_exists: false,
            applied_migrations: Vec::new(),
            pending_migrations: Vec::new(),
            missing_tables: Vec::new(),
            errors: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ClickHouseClient {
    cfg: ClickHouseConfig,
    http: Client,
}

impl ClickHouseClient {
    pub fn new(cfg: ClickHouseConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_seconds.max(1.0)))
            .build()
            .context("failed to construct reqwest client")?;
        Ok(Self { cfg, http })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.cfg
    }

    fn statement_url(&self, stmt: &Statement<'_>) -> Result<Url> {
        let mut url = Url::parse(&self.cfg.url).context("invalid ClickHouse URL")?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("query", stmt.sql);
            if let Some(database) = stmt.database {
                qp.append_pair("database", database);
            }
            if let Some(format) = stmt.format {
                qp.append_pair("default_format", format);
            }
            if stmt.async_insert && self.cfg.async_insert {
                qp.append_pair("async_insert", "1");
                if self.cfg.wait_for_async_insert {
                    qp.append_pair("wait_for_async_insert", "1");
                }
            }
            for (key, value) in &stmt.settings {
                qp.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Sends `stmt` and returns the response body. Non-2xx answers surface as
    /// [`ClickHouseError::Status`] so callers can classify them.
    pub async fn execute(&self, stmt: Statement<'_>) -> Result<String> {
        let url = self.statement_url(&stmt)?;

        // GET is readonly on the HTTP interface; everything goes out as POST.
        let mut req = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(CONTENT_LENGTH, stmt.body.len())
            .body(stmt.body);
        if !self.cfg.username.is_empty() {
            req = req.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        let response = req
            .send()
            .await
            .map_err(ClickHouseError::Transport)
            .context("clickhouse request failed")?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(ClickHouseError::Transport)
            .with_context(|| format!("failed to read clickhouse response body (status {status})"))?;

        if !status.is_success() {
            return Err(ClickHouseError::Status {
                status: status.as_u16(),
                body: text,
            }
            .into());
        }
        Ok(text)
    }

    /// Runs a query with `FORMAT JSON` output and decodes its `data` rows.
    pub async fn select<T: DeserializeOwned>(
        &self,
        sql: &str,
        database: Option<&str>,
    ) -> Result<Vec<T>> {
        let database = database.unwrap_or(&self.cfg.database);
        let raw = self
            .execute(Statement::new(sql).database(database).format("JSON"))
            .await?;
        let envelope: JsonEnvelope<T> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid clickhouse JSON response: {raw}"))?;
        Ok(envelope.data)
    }

    /// Inserts `rows` into `table` as a single block. A block resent with the
    /// same `dedup_token` is dropped server side.
    pub async fn insert_rows(
        &self,
        table: &str,
        rows: &[Value],
        dedup_token: Option<&str>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut payload = Vec::<u8>::new();
        for row in rows {
            serde_json::to_writer(&mut payload, row).context("failed to encode JSON row")?;
            payload.push(b'\n');
        }

        let sql = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            escape_identifier(&self.cfg.database),
            escape_identifier(table)
        );
        let mut stmt = Statement::new(&sql).body(payload).async_insert();
        if let Some(token) = dedup_token {
            stmt = stmt.setting("insert_deduplication_token", token);
        }
        self.execute(stmt).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let response = self
            .execute(Statement::new("SELECT 1").database("system"))
            .await?;
        match response.trim() {
            "1" => Ok(()),
            other => Err(anyhow!("unexpected ping response: {other}")),
        }
    }

    pub async fn version(&self) -> Result<String> {
        let rows: Vec<Value> = self
            .select("SELECT version() AS version", Some("system"))
            .await?;
        rows.first()
            .and_then(|row| row.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("missing version in payload"))
    }

    /// Creates the database and applies every bundled migration not yet in
    /// the ledger. Returns the versions applied by this call.
    pub async fn run_migrations(&self) -> Result<Vec<String>> {
        let database = self.cfg.database.as_str();
        validate_identifier(database)?;

        let create = format!("CREATE DATABASE IF NOT EXISTS {}", escape_identifier(database));
        self.execute(Statement::new(&create)).await?;
        self.ensure_migration_ledger().await?;
        let applied = self.applied_migration_versions().await?;

        let mut executed = Vec::new();
        for migration in bundled_migrations()
            .into_iter()
            .filter(|m| !applied.contains(m.version))
        {
            let sql = materialize_migration_sql(migration.sql, database)?;
            for statement in split_sql_statements(&sql) {
                self.execute(Statement::new(&statement).database(database))
                    .await
                    .with_context(|| {
                        format!(
                            "migration {} failed at: {}",
                            migration.name,
                            truncate_for_error(&statement)
                        )
                    })?;
            }

            let record = format!(
                "INSERT INTO {}.schema_migrations (version, name) VALUES ({}, {})",
                escape_identifier(database),
                escape_literal(migration.version),
                escape_literal(migration.name)
            );
            self.execute(Statement::new(&record).database(database))
                .await
                .with_context(|| format!("failed to record migration {}", migration.name))?;
            executed.push(migration.version.to_string());
        }

        Ok(executed)
    }

    /// Health of the server and the schema. Probe failures are reported in
    /// `errors` rather than returned.
    pub async fn doctor_report(&self) -> Result<DoctorReport> {
        let mut report = DoctorReport::new(&self.cfg.database);
        if let Err(problem) = self.inspect(&mut report).await {
            report.errors.push(problem);
        }
        Ok(report)
    }

    async fn inspect(&self, report: &mut DoctorReport) -> std::result::Result<(), String> {
        self.ping()
            .await
            .map_err(|err| format!("ping failed: {err}"))?;
        report.clickhouse_healthy = true;

        match self.version().await {
            Ok(version) => report.clickhouse_version = Some(version),
            Err(err) => report.errors.push(format!("version query failed: {err}")),
        }

        let databases = format!(
            "SELECT name FROM system.databases WHERE name = {}",
            escape_literal(&self.cfg.database)
        );
        report.database_exists = self
            .select::<Value>(&databases, Some("system"))
            .await
            .map_err(|err| format!("database existence query failed: {err}"))?
            .first()
            .is_some();
        if !report.database_exists {
            return Err(format!("database '{}' does not exist", self.cfg.database));
        }

        match self.applied_migration_versions().await {
            Ok(applied) => {
                let mut versions: Vec<String> = applied.into_iter().collect();
                versions.sort();
                report.applied_migrations = versions;
            }
            Err(err) => report
                .errors
                .push(format!("failed to read migration ledger: {err}")),
        }
        report.pending_migrations = bundled_migrations()
            .into_iter()
            .map(|m| m.version.to_string())
            .filter(|version| !report.applied_migrations.contains(version))
            .collect();

        let existing = self
            .table_names()
            .await
            .map_err(|err| format!("table listing failed: {err}"))?;
        report.missing_tables = REQUIRED_TABLES
            .iter()
            .filter(|name| !existing.contains(**name))
            .map(|name| name.to_string())
            .collect();
        Ok(())
    }

    async fn table_names(&self) -> Result<HashSet<String>> {
        #[derive(Deserialize)]
        struct TableRow {
            name: String,
        }

        let sql = format!(
            "SELECT name FROM system.tables WHERE database = {}",
            escape_literal(&self.cfg.database)
        );
        let rows: Vec<TableRow> = self.select(&sql, Some("system")).await?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }

    async fn ensure_migration_ledger(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {}.schema_migrations (\
             version String, \
             name String, \
             applied_at DateTime64(3) DEFAULT now64(3)\
             ) ENGINE = ReplacingMergeTree(applied_at) \
             ORDER BY (version)",
            escape_identifier(&self.cfg.database)
        );
        self.execute(Statement::new(&sql).database(&self.cfg.database))
            .await?;
        Ok(())
    }

    async fn applied_migration_versions(&self) -> Result<HashSet<String>> {
        #[derive(Deserialize)]
        struct LedgerRow {
            version: String,
        }

        let sql = format!(
            "SELECT version FROM {}.schema_migrations GROUP BY version",
            escape_identifier(&self.cfg.database)
        );
        let rows: Vec<LedgerRow> = self.select(&sql, None).await?;
        Ok(rows.into_iter().map(|row| row.version).collect())
    }
}

pub fn bundled_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: "001",
            name: "001_schema.sql",
            sql: include_str!("../../../sql/001_schema.sql"),
        },
        Migration {
            version: "002",
            name: "002_views.sql",
            sql: include_str!("../../../sql/002_views.sql"),
        },
        Migration {
            version: "003",
            name: "003_ingest_heartbeats.sql",
            sql: include_str!("../../../sql/003_ingest_heartbeats.sql"),
        },
    ]
}

fn truncate_for_error(statement: &str) -> String {
    const LIMIT: usize = 240;
    let compact = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    match compact.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &compact[..cut]),
        None => compact,
    }
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        bail!("identifier must not be empty");
    }
    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("identifier contains unsupported characters: {identifier}");
    }
    Ok(())
}

/// Points the bundled SQL, written against `esker`, at `database`.
fn materialize_migration_sql(sql: &str, database: &str) -> Result<String> {
    validate_identifier(database)?;
    Ok(sql
        .replace(
            "CREATE DATABASE IF NOT EXISTS esker;",
            &format!("CREATE DATABASE IF NOT EXISTS {database};"),
        )
        .replace("esker.", &format!("{database}.")))
}

/// Splits a migration file on `;` outside string literals. Whole-line `--`
/// comments are dropped.
fn split_sql_statements(sql: &str) -> Vec<String> {
    fn flush(statements: &mut Vec<String>, current: &mut String) {
        let statement = current.trim();
        if !statement.is_empty() {
            statements.push(statement.to_string());
        }
        current.clear();
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for line in sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
    {
        let mut chars = line.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' if quoted => {
                    current.push(ch);
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                '\'' if quoted && chars.peek() == Some(&'\'') => {
                    chars.next();
                    current.push_str("''");
                }
                '\'' => {
                    quoted = !quoted;
                    current.push(ch);
                }
                ';' if !quoted => flush(&mut statements, &mut current),
                _ => current.push(ch),
            }
        }
        current.push('\n');
    }
    flush(&mut statements, &mut current);

    statements
}

pub fn escape_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

pub fn escape_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
