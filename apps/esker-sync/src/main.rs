mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, CliCommand, DbCommand, OutputFormat, RootArgs};
use esker_clickhouse::{ClickHouseClient, DoctorReport};
use esker_config::{AppConfig, WatchMode};
use esker_sync_core::{CycleReport, MigrationRun, MigrationStatus, SyncEngine, SyncStatus};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct CliOutput {
    format: OutputFormat,
}

impl CliOutput {
    fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn section(&self, title: &str, lines: &[String]) {
        if self.is_json() {
            return;
        }
        println!("{title}");
        for line in lines {
            println!("  {line}");
        }
    }
}

#[derive(Serialize)]
struct StatusSnapshot {
    sync: SyncStatus,
    dead_letter_batches: usize,
    migrations: Vec<MigrationSummary>,
}

#[derive(Serialize)]
struct MigrationSummary {
    id: String,
    status: MigrationStatus,
    root: String,
    started_at: String,
    files_done: u64,
    files_total: u64,
}

#[derive(Serialize)]
struct MigrationOutcome {
    applied: Vec<String>,
}

fn load_cfg(raw_config: Option<PathBuf>) -> Result<(PathBuf, AppConfig)> {
    let config_path = esker_config::resolve_config_path(raw_config);
    let cfg = esker_config::load_config(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    Ok((config_path, cfg))
}

fn root_of(args: &RootArgs, cfg: &AppConfig) -> String {
    args.root
        .clone()
        .unwrap_or_else(|| cfg.sync.root_dir.clone())
}

async fn cmd_watch(engine: &SyncEngine, root: &str, mode: WatchMode) -> Result<()> {
    let handle = engine.start_incremental_sync(root, mode)?;
    info!("esker-sync running; waiting for shutdown signal");
    tokio::signal::ctrl_c()
        .await
        .context("signal handler failed")?;
    info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}

async fn cmd_migrate(
    engine: &SyncEngine,
    root: &str,
    resume: Option<String>,
) -> Result<MigrationRun> {
    let id = match resume {
        Some(id) => {
            engine.resume_migration(&id).await?;
            id
        }
        None => engine.start_historical_migration(root).await?,
    };
    info!(run_id = %id, "migration running; ctrl-c pauses it");

    let wait = engine.wait_migration(&id);
    tokio::pin!(wait);
    let finished = tokio::select! {
        outcome = &mut wait => Some(outcome),
        signal = tokio::signal::ctrl_c() => {
            signal.context("signal handler failed")?;
            None
        }
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            info!(run_id = %id, "pausing migration");
            engine.pause_migration(&id).await?;
            wait.await
        }
    };

    match outcome {
        Ok(run) => Ok(run),
        Err(exc) => {
            warn!(run_id = %id, "{exc}");
            engine
                .get_migration_status(&id)
                .await
                .with_context(|| format!("migration run {id} disappeared"))
        }
    }
}

async fn cmd_status(engine: &SyncEngine) -> Result<StatusSnapshot> {
    let migrations = engine
        .migration_runs()
        .await
        .into_iter()
        .map(|run| MigrationSummary {
            files_total: run.files_total(),
            id: run.id,
            status: run.status,
            root: run.root,
            started_at: run.started_at,
            files_done: run.files_done,
        })
        .collect();
    Ok(StatusSnapshot {
        sync: engine.get_sync_status().await,
        dead_letter_batches: engine.dead_letters().len()?,
        migrations,
    })
}

async fn cmd_db_migrate(cfg: &AppConfig) -> Result<MigrationOutcome> {
    let ch = ClickHouseClient::new(cfg.clickhouse.clone())?;
    let applied = ch.run_migrations().await?;
    Ok(MigrationOutcome { applied })
}

async fn cmd_db_doctor(cfg: &AppConfig) -> Result<DoctorReport> {
    let ch = ClickHouseClient::new(cfg.clickhouse.clone())?;
    ch.doctor_report().await
}

fn doctor_is_healthy(report: &DoctorReport) -> bool {
    report.clickhouse_healthy
        && report.database_exists
        && report.pending_migrations.is_empty()
        && report.missing_tables.is_empty()
        && report.errors.is_empty()
}

fn none_or_joined(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

fn render_cycle(output: &CliOutput, report: &CycleReport) -> Result<()> {
    if output.is_json() {
        return output.json(report);
    }
    let mut lines = vec![
        format!("root: {}", report.root),
        format!(
            "files changed: {} (deleted {}, reset {})",
            report.files_changed, report.files_deleted, report.files_reset
        ),
        format!("lines read: {}", report.lines),
        format!("records: {}", report.records),
        format!("rows written: {}", report.rows),
        format!("parse errors: {}", report.parse_errors),
        format!("dead-lettered batches: {}", report.dead_lettered_batches),
    ];
    for failure in &report.failures {
        lines.push(format!("failed {} ({}): {}", failure.path, failure.kind, failure.error));
    }
    output.section("Sync Cycle", &lines);
    Ok(())
}

fn render_run(output: &CliOutput, run: &MigrationRun) -> Result<()> {
    if output.is_json() {
        return output.json(run);
    }
    let mut lines = vec![
        format!("id: {}", run.id),
        format!("status: {}", run.status),
        format!("root: {}", run.root),
        format!("started: {}", run.started_at),
        format!(
            "files: {} done, {} failed, {} total",
            run.files_done,
            run.files_failed,
            run.files_total()
        ),
        format!("records ingested: {}", run.records_ingested),
        format!("tokens seen: {}", run.tokens_seen),
    ];
    if let Some(ended) = &run.ended_at {
        lines.push(format!("ended: {ended}"));
    }
    if let Some(report) = &run.validation {
        lines.push(format!(
            "validation: source {} vs store {} tokens, variance {:.6} (tolerance {})",
            report.source_tokens, report.store_tokens, report.variance, report.tolerance
        ));
    }
    for error in &run.errors {
        lines.push(format!("error: {error}"));
    }
    output.section("Migration Run", &lines);
    Ok(())
}

fn render_status(output: &CliOutput, snapshot: &StatusSnapshot) -> Result<()> {
    if output.is_json() {
        return output.json(snapshot);
    }
    let sync = &snapshot.sync;
    let errors = &sync.error_counts;
    output.section(
        "Live Sync",
        &[
            format!("files tracked: {}", sync.files_tracked),
            format!("committed bytes: {}", sync.offsets.committed_bytes),
            format!("rotations: {}", sync.offsets.rotations),
            format!("last commit unix ms: {}", sync.offsets.last_commit_unix_ms),
            format!("dead-lettered batches on disk: {}", snapshot.dead_letter_batches),
            format!(
                "errors: parse {}, file {}, transient {}, permanent {}",
                errors.parse, errors.file_access, errors.transient_ingest, errors.permanent_ingest
            ),
        ],
    );
    if !snapshot.migrations.is_empty() {
        let lines: Vec<String> = snapshot
            .migrations
            .iter()
            .map(|run| {
                format!(
                    "{} {} {}/{} files ({})",
                    run.id, run.status, run.files_done, run.files_total, run.root
                )
            })
            .collect();
        output.section("Migration Runs", &lines);
    }
    Ok(())
}

fn render_db_migrate(output: &CliOutput, outcome: &MigrationOutcome) -> Result<()> {
    if output.is_json() {
        return output.json(outcome);
    }
    if outcome.applied.is_empty() {
        output.section("Database Migrations", &["already up to date".to_string()]);
        return Ok(());
    }
    output.section("Applied Migrations", &outcome.applied);
    Ok(())
}

fn render_db_doctor(output: &CliOutput, report: &DoctorReport) -> Result<()> {
    if output.is_json() {
        return output.json(report);
    }
    let mut lines = vec![
        format!(
            "clickhouse: {}",
            if report.clickhouse_healthy { "healthy" } else { "unreachable" }
        ),
        format!("database: {}", report.database),
        format!("database exists: {}", report.database_exists),
        format!("pending migrations: {}", none_or_joined(&report.pending_migrations)),
        format!("missing tables: {}", none_or_joined(&report.missing_tables)),
    ];
    if let Some(version) = &report.clickhouse_version {
        lines.push(format!("clickhouse version: {version}"));
    }
    if !report.errors.is_empty() {
        lines.push(format!("errors: {}", report.errors.join(" | ")));
    }
    output.section("DB Doctor", &lines);
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let output = CliOutput { format: cli.output };
    let (_, cfg) = load_cfg(cli.config.clone())?;

    match cli.command {
        CliCommand::Watch(args) => {
            let root = root_of(&args.root, &cfg);
            let mode = if args.poll {
                WatchMode::Poll
            } else {
                cfg.sync.watch_mode
            };
            let engine = SyncEngine::connect(cfg)?;
            cmd_watch(&engine, &root, mode).await?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Once(args) => {
            let root = root_of(&args, &cfg);
            let engine = SyncEngine::connect(cfg)?;
            let report = engine.run_once(&root).await?;
            render_cycle(&output, &report)?;
            if report.failures.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }
        CliCommand::Migrate(args) => {
            let root = root_of(&args.root, &cfg);
            let engine = SyncEngine::connect(cfg)?;
            let run = cmd_migrate(&engine, &root, args.resume).await?;
            render_run(&output, &run)?;
            match run.status {
                MigrationStatus::Completed | MigrationStatus::Paused => Ok(ExitCode::SUCCESS),
                _ => Ok(ExitCode::from(1)),
            }
        }
        CliCommand::MigrationStatus(args) => {
            let engine = SyncEngine::connect(cfg)?;
            let run = engine
                .get_migration_status(&args.id)
                .await
                .with_context(|| format!("no migration run with id {}", args.id))?;
            render_run(&output, &run)?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Status => {
            let engine = SyncEngine::connect(cfg)?;
            let snapshot = cmd_status(&engine).await?;
            render_status(&output, &snapshot)?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Db(args) => match args.command {
            DbCommand::Migrate => {
                let outcome = cmd_db_migrate(&cfg).await?;
                render_db_migrate(&output, &outcome)?;
                Ok(ExitCode::SUCCESS)
            }
            DbCommand::Doctor => {
                let report = cmd_db_doctor(&cfg).await?;
                render_db_doctor(&output, &report)?;
                if doctor_is_healthy(&report) {
                    Ok(ExitCode::SUCCESS)
                } else {
                    Ok(ExitCode::from(1))
                }
            }
        },
    }
}
