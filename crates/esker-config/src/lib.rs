use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickHouseConfig {
    #[serde(default = "default_ch_url")]
    pub url: String,
    #[serde(default = "default_ch_database")]
    pub database: String,
    #[serde(default = "default_ch_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub async_insert: bool,
    #[serde(default = "default_true")]
    pub wait_for_async_insert: bool,
}

/// How the live sync loop learns about file changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// OS file notifications, falling back to polling if they are unavailable.
    Native,
    /// Rescan the root every `poll_interval_ms`.
    Poll,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_file_glob")]
    pub file_glob: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_watch_mode")]
    pub watch_mode: WatchMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: f64,
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: f64,
    #[serde(default = "default_max_file_workers")]
    pub max_file_workers: usize,
    #[serde(default = "default_batch_max_rows")]
    pub batch_max_rows: usize,
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,
    #[serde(default = "default_batch_hard_cap_bytes")]
    pub batch_hard_cap_bytes: usize,
    #[serde(default = "default_fingerprint_window_bytes")]
    pub fingerprint_window_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_batch_timeout_seconds")]
    pub batch_timeout_seconds: f64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    #[serde(default = "default_migration_workers")]
    pub max_file_workers: usize,
    #[serde(default = "default_true")]
    pub validate_on_complete: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Maximum accepted `|store - source| / source` ratio.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_ch_url(),
            database: default_ch_database(),
            username: default_ch_username(),
            password: String::new(),
            timeout_seconds: default_timeout_seconds(),
            async_insert: true,
            wait_for_async_insert: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            file_glob: default_file_glob(),
            state_dir: default_state_dir(),
            watch_mode: default_watch_mode(),
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            reconcile_interval_seconds: default_reconcile_interval_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            max_file_workers: default_max_file_workers(),
            batch_max_rows: default_batch_max_rows(),
            batch_max_bytes: default_batch_max_bytes(),
            batch_max_wait_ms: default_batch_max_wait_ms(),
            batch_hard_cap_bytes: default_batch_hard_cap_bytes(),
            fingerprint_window_bytes: default_fingerprint_window_bytes(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_timeout_seconds: default_batch_timeout_seconds(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_file_workers: default_migration_workers(),
            validate_on_complete: true,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            clickhouse: ClickHouseConfig::default(),
            sync: SyncConfig::default(),
            ingest: IngestConfig::default(),
            migration: MigrationConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

fn default_ch_url() -> String {
    "http://127.0.0.1:8123".to_string()
}

fn default_ch_database() -> String {
    "esker".to_string()
}

fn default_ch_username() -> String {
    "default".to_string()
}

fn default_timeout_seconds() -> f64 {
    30.0
}

fn default_root_dir() -> String {
    "~/.claude/projects".to_string()
}

fn default_file_glob() -> String {
    "**/*.jsonl".to_string()
}

fn default_state_dir() -> String {
    "~/.esker/state".to_string()
}

fn default_watch_mode() -> WatchMode {
    WatchMode::Native
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_reconcile_interval_seconds() -> f64 {
    30.0
}

fn default_heartbeat_interval_seconds() -> f64 {
    5.0
}

fn default_max_file_workers() -> usize {
    4
}

fn default_batch_max_rows() -> usize {
    4000
}

fn default_batch_max_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_batch_max_wait_ms() -> u64 {
    500
}

fn default_batch_hard_cap_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_fingerprint_window_bytes() -> u64 {
    1024
}

fn default_batch_timeout_seconds() -> f64 {
    15.0
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_migration_workers() -> usize {
    2
}

fn default_tolerance() -> f64 {
    0.001
}

fn default_true() -> bool {
    true
}

pub fn expand_path(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{}", home.to_string_lossy(), stripped);
        }
    }
    path.to_string()
}

const CONFIG_ENV: &str = "ESKER_CONFIG";

fn home_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".esker/config.toml"))
}

/// Picks the config file: an explicit path, then the first non-blank env
/// var in `env_keys`, then whichever of `home_path` and `repo_default`
/// exists. With neither on disk the home location is returned so the load
/// error names it.
fn resolve_config_path_with_overrides(
    raw_path: Option<PathBuf>,
    env_keys: &[&str],
    home_path: Option<PathBuf>,
    repo_default: PathBuf,
) -> PathBuf {
    let from_env = || {
        env_keys.iter().find_map(|key| {
            let value = std::env::var(key).ok()?;
            let value = value.trim();
            (!value.is_empty()).then(|| PathBuf::from(value))
        })
    };
    let on_disk = || {
        home_path
            .iter()
            .chain(std::iter::once(&repo_default))
            .find(|path| path.exists())
            .cloned()
    };

    raw_path
        .or_else(from_env)
        .or_else(on_disk)
        .or_else(|| home_path.clone())
        .unwrap_or_else(|| repo_default.clone())
}

pub fn resolve_config_path(raw_path: Option<PathBuf>) -> PathBuf {
    resolve_config_path_with_overrides(
        raw_path,
        &[CONFIG_ENV],
        home_config_path(),
        PathBuf::from("config/esker.toml"),
    )
}

fn normalize_config(mut cfg: AppConfig) -> AppConfig {
    cfg.sync.root_dir = expand_path(&cfg.sync.root_dir);
    cfg.sync.state_dir = expand_path(&cfg.sync.state_dir);
    cfg.sync.max_file_workers = cfg.sync.max_file_workers.max(1);
    cfg.sync.batch_max_rows = cfg.sync.batch_max_rows.max(1);
    cfg.sync.batch_hard_cap_bytes = cfg.sync.batch_hard_cap_bytes.max(cfg.sync.batch_max_bytes);
    cfg.ingest.retry_max_attempts = cfg.ingest.retry_max_attempts.max(1);
    cfg.migration.max_file_workers = cfg.migration.max_file_workers.max(1);
    cfg
}

/// Returns the config a missing file would produce, with paths expanded.
pub fn default_config() -> AppConfig {
    normalize_config(AppConfig::default())
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
    let cfg: AppConfig = toml::from_str(&content).context("failed to parse TOML config")?;
    Ok(normalize_config(cfg))
}
