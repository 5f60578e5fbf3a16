use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use verabot_config::LoggingConfig;

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let filter = build_filter(
        level_override,
        std::env::var("RUST_LOG").ok().as_deref(),
        &config.level,
    )?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }
    Ok(())
}

/// Pick a filter: `--log-level` beats `RUST_LOG`, which beats the config file.
fn build_filter(
    level_override: Option<&str>,
    rust_log: Option<&str>,
    configured: &str,
) -> Result<EnvFilter> {
    let directives = level_override
        .or(rust_log.filter(|s| !s.trim().is_empty()))
        .unwrap_or(configured);
    EnvFilter::try_new(directives).with_context(|| format!("invalid log filter {directives:?}"))
}
