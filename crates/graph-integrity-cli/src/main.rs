use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use graph_integrity_core::IssueType;
use graph_integrity_healing::{HealingConfig, HealingRuntime, SystemClock};
use graph_integrity_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "gi")]
#[command(about = "Graph store integrity checks and self-healing")]
struct Cli {
    #[arg(long, default_value = "./graph.sqlite3")]
    db: PathBuf,

    /// YAML configuration file; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Run the health probe battery.
    Health,
    /// List integrity issues without changing anything.
    Scan,
    /// Run one repair session.
    Repair(RepairArgs),
    /// Execute one scheduled task immediately.
    Run(RunArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Run the scheduler until interrupted.
    Serve,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct RepairArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(value_enum)]
    task: RunTask,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunTask {
    Nightly,
    Weekly,
    Manual,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn async_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn load_config(path: Option<&Path>) -> Result<HealingConfig> {
    match path {
        Some(path) => HealingConfig::load(path),
        None => Ok(HealingConfig::default()),
    }
}

fn open_runtime(cli: &Cli, clock: SystemClock) -> Result<HealingRuntime> {
    let config = load_config(cli.config.as_deref())?;
    let store = Arc::new(SqliteStore::open(&cli.db)?);
    let reporter = HealingRuntime::default_reporter(&config.report);
    HealingRuntime::new(store, &config, reporter, Arc::new(clock))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    // The local offset has to be read before any worker threads exist.
    let clock = SystemClock::local();

    match &cli.command {
        Command::Db { command } => {
            let store = SqliteStore::open(&cli.db)?;
            run_db(command, &store)
        }
        Command::Config { command: ConfigCommand::Show } => {
            let config = load_config(cli.config.as_deref())?;
            emit_json(serde_json::to_value(config)?)
        }
        Command::Health => run_health(&open_runtime(&cli, clock)?),
        Command::Scan => run_scan(&open_runtime(&cli, clock)?),
        Command::Repair(args) => run_repair(args, &open_runtime(&cli, clock)?),
        Command::Run(args) => run_task(args, &open_runtime(&cli, clock)?),
        Command::Serve => run_serve(&open_runtime(&cli, clock)?),
    }
}

fn run_db(command: &DbCommand, store: &SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(args, store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_health(runtime: &HealingRuntime) -> Result<()> {
    let result = async_runtime()?.block_on(runtime.monitor.run_health_checks());
    emit_json(serde_json::to_value(result)?)
}

fn run_scan(runtime: &HealingRuntime) -> Result<()> {
    let issues = runtime.monitor.find_integrity_issues().context("integrity scan failed")?;
    let mut by_type: BTreeMap<IssueType, usize> = BTreeMap::new();
    for issue in &issues {
        *by_type.entry(issue.issue_type).or_default() += 1;
    }
    emit_json(serde_json::json!({
        "issue_count": issues.len(),
        "by_type": by_type,
        "issues": issues
    }))
}

fn run_repair(args: &RepairArgs, runtime: &HealingRuntime) -> Result<()> {
    let session = runtime
        .engine
        .start_repair_session(args.dry_run)
        .context("repair session failed")?;
    let successful = session.count_successful();
    let mut value = serde_json::to_value(&session)?;
    if let Value::Object(object) = &mut value {
        object.insert("successful".to_string(), Value::from(successful));
    }
    emit_json(value)
}

fn run_task(args: &RunArgs, runtime: &HealingRuntime) -> Result<()> {
    let scheduler = &runtime.scheduler;
    let task = async_runtime()?.block_on(async {
        match args.task {
            RunTask::Nightly => scheduler.run_nightly_check().await,
            RunTask::Weekly => scheduler.run_weekly_deep_analysis().await,
            RunTask::Manual => scheduler.run_manual_check().await,
        }
    });
    emit_json(serde_json::to_value(task)?)
}

fn run_serve(runtime: &HealingRuntime) -> Result<()> {
    async_runtime()?.block_on(async {
        runtime.scheduler.start();
        info!("scheduler running; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
        runtime.scheduler.stop();
        // Dropping the runtime would cancel a tick mid-run and leave its task Running.
        runtime.scheduler.wait_idle().await;
        Ok::<_, anyhow::Error>(())
    })?;
    emit_json(serde_json::to_value(runtime.scheduler.get_status())?)
}
