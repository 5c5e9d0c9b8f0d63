use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "esker-sync",
    about = "Incremental sync of session logs into ClickHouse"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    pub output: OutputFormat,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Follow the log root and sync changes until interrupted.
    Watch(WatchArgs),
    /// Run a single sync pass over the log root.
    Once(RootArgs),
    /// Backfill the whole log root as a resumable migration run.
    Migrate(MigrateArgs),
    /// Show the saved state of a migration run.
    MigrationStatus(MigrationStatusArgs),
    /// Show committed offsets, dead letters and migration runs.
    Status,
    Db(DbArgs),
}

#[derive(Debug, Args)]
pub struct RootArgs {
    /// Directory to sync instead of `sync.root_dir`.
    #[arg(long, value_name = "DIR")]
    pub root: Option<String>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub root: RootArgs,
    /// Poll instead of using OS file notifications.
    #[arg(long)]
    pub poll: bool,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub root: RootArgs,
    /// Resume an existing run instead of starting a new one.
    #[arg(long, value_name = "ID")]
    pub resume: Option<String>,
}

#[derive(Debug, Args)]
pub struct MigrationStatusArgs {
    #[arg(value_name = "ID")]
    pub id: String,
}

#[derive(Debug, Args)]
pub struct DbArgs {
    #[command(subcommand)]
    pub command: DbCommand,
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
    Doctor,
}
