use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Select};
use tracing::info;
use verabot_config::{AppConfig, DatabaseConfig, LoggingConfig};

/// Run the interactive setup. Writes `config.yml` into `config_dir`.
pub fn run_wizard(config_dir: &Path) -> Result<()> {
    let config_path = config_dir.join("config.yml");

    if !std::io::stdin().is_terminal() {
        println!("Non-interactive environment detected.");
        println!("To configure VeraBot, create: {}", config_path.display());
        println!();
        println!("Minimal config.yml example:");
        println!("---");
        print!("{}", render_config(&AppConfig::default())?);
        return Ok(());
    }

    println!();
    println!("  VeraBot Setup");
    println!("  -------------");
    println!();

    if config_path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} exists. Overwrite it?", config_path.display()))
            .default(false)
            .interact()
            .context("overwrite confirmation cancelled")?;
        if !overwrite {
            println!("  Keeping existing config.");
            return Ok(());
        }
    }

    // --- Database ---
    let db_path: String = Input::new()
        .with_prompt("SQLite database path (relative to the config directory)")
        .default("data/verabot.db".to_string())
        .interact_text()
        .context("database path input cancelled")?;

    let statement_timeout_secs: u64 = Input::new()
        .with_prompt("Per-statement migration timeout in seconds (0 = none)")
        .default(30)
        .interact_text()
        .context("timeout input cancelled")?;

    // --- Logging ---
    let levels = &["info", "debug", "warn", "error", "trace"];
    let level = Select::new()
        .with_prompt("Default log level")
        .items(levels)
        .default(0)
        .interact()
        .context("log level selection cancelled")?;

    let json = Confirm::new()
        .with_prompt("Emit JSON logs?")
        .default(false)
        .interact()
        .context("log format selection cancelled")?;

    let config = AppConfig {
        database: DatabaseConfig {
            path: Some(PathBuf::from(db_path.trim())),
            statement_timeout_secs,
        },
        logging: LoggingConfig {
            level: levels[level].to_string(),
            json,
        },
    };

    write_config(config_dir, &config)?;
    println!();
    println!("  Config written to {}", config_path.display());
    println!("  Run `verabot migrate` to create the schema.");
    println!();

    Ok(())
}

fn render_config(config: &AppConfig) -> Result<String> {
    serde_yaml::to_string(config).context("failed to serialize config")
}

fn write_config(config_dir: &Path, config: &AppConfig) -> Result<PathBuf> {
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("failed to create {}", config_dir.display()))?;

    let config_path = config_dir.join("config.yml");
    std::fs::write(&config_path, render_config(config)?)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    info!("config written to {}", config_path.display());
    Ok(config_path)
}
