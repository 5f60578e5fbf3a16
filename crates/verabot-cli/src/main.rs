mod banner;
mod logging;
mod wizard;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use verabot_config::{AppConfig, ConfigLoader};
use verabot_db::{MigrationRunner, SqliteExecutor};

#[derive(Parser)]
#[command(name = "verabot", version)]
#[command(about = "VeraBot storage and schema migration tooling")]
struct Cli {
    /// Config directory (defaults to ~/.verabot)
    #[arg(long, global = true, env = "VERABOT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// SQLite database file, overriding the configured path
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `verabot_db=trace`. Takes precedence over RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply every pending migration
    Migrate,

    /// Roll back applied migrations above a version
    Rollback {
        /// Version to keep; everything above it is undone. `0` undoes all.
        #[arg(long)]
        to: u32,
    },

    /// Show applied and pending migrations
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a starter config.yml
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional
    let _ = dotenvy::dotenv();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new()?,
    };

    let mut config = match cli.command {
        Command::Init => AppConfig::default(),
        _ => loader.load().context("failed to load configuration")?,
    };
    if cli.json_logs {
        config.logging.json = true;
    }
    logging::init(&config.logging, cli.log_level.as_deref())?;

    if let Command::Init = cli.command {
        return wizard::run_wizard(loader.config_dir());
    }

    let db_path = cli
        .database
        .unwrap_or_else(|| config.database.resolved_path(loader.config_dir()));
    let db = open_database(&db_path)?;
    let runner = MigrationRunner::builtin()?
        .with_statement_timeout(config.database.statement_timeout());

    match cli.command {
        Command::Migrate => {
            let report = runner.apply_all(&db).await.with_context(|| {
                format!(
                    "migration aborted; {} may be partially migrated, inspect it before retrying",
                    db_path.display()
                )
            })?;
            if report.applied_versions.is_empty() {
                println!("Schema already at version {}.", runner.latest_version());
            } else {
                println!("Applied migrations: {}", join_versions(&report.applied_versions));
            }
        }
        Command::Rollback { to } => {
            let report = runner
                .rollback(&db, to)
                .await
                .with_context(|| format!("rollback to version {to} aborted"))?;
            if report.rolled_back_versions.is_empty() {
                println!("Nothing to roll back above version {to}.");
            } else {
                println!(
                    "Rolled back migrations: {}",
                    join_versions(&report.rolled_back_versions)
                );
            }
        }
        Command::Status { json } => {
            let status = runner.status(&db).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", banner::render_status(&status, &db_path));
            }
        }
        Command::Init => unreachable!("handled above"),
    }

    Ok(())
}

fn open_database(path: &Path) -> Result<SqliteExecutor> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    info!("using database {}", path.display());
    Ok(SqliteExecutor::open(path)?)
}

fn join_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
