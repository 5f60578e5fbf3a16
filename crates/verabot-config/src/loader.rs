use std::path::{Path, PathBuf};

use tracing::{debug, info};
use verabot_common::{Error, Result};

use crate::model::AppConfig;

/// File names tried, in order, inside the config directory.
const CONFIG_FILES: &[&str] = &["config.yml", "config.yaml", "config.toml"];

pub const ENV_DATABASE_PATH: &str = "VERABOT_DATABASE_PATH";
pub const ENV_STATEMENT_TIMEOUT: &str = "VERABOT_STATEMENT_TIMEOUT_SECS";
pub const ENV_LOG_LEVEL: &str = "VERABOT_LOG_LEVEL";

/// Locates and parses VeraBot configuration.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Loader rooted at `~/.verabot`.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not determine home directory".into()))?;
        Ok(Self::with_dir(home.join(".verabot")))
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// The first existing config file, if any.
    pub fn config_path(&self) -> Option<PathBuf> {
        CONFIG_FILES
            .iter()
            .map(|name| self.config_dir.join(name))
            .find(|path| path.is_file())
    }

    /// Load config from the config directory, falling back to defaults when no
    /// file exists, then apply `VERABOT_*` environment overrides.
    pub fn load(&self) -> Result<AppConfig> {
        let mut config = match self.config_path() {
            Some(path) => Self::load_from(&path)?,
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a specific file, dispatching on its extension.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("loaded config from {}", path.display());
        Ok(config)
    }
}

/// Override config values from the environment. `lookup` is usually
/// `std::env::var`, but tests pass a map.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup(ENV_DATABASE_PATH).filter(|p| !p.is_empty()) {
        config.database.path = Some(PathBuf::from(path));
    }

    if let Some(raw) = lookup(ENV_STATEMENT_TIMEOUT) {
        config.database.statement_timeout_secs = raw.trim().parse().map_err(|_| {
            Error::Config(format!("{ENV_STATEMENT_TIMEOUT} must be an integer, got {raw:?}"))
        })?;
    }

    if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|l| !l.is_empty()) {
        config.logging.level = level;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_dir(dir.path());
        assert!(loader.config_path().is_none());

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |_| None).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn loads_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yml"),
            "database:\n  path: quotes.db\n  statement_timeout_secs: 5\nlogging:\n  level: debug\n",
        )
        .unwrap();

        let loader = ConfigLoader::with_dir(dir.path());
        let path = loader.config_path().unwrap();
        let config = ConfigLoader::load_from(&path).unwrap();
        assert_eq!(config.database.path, Some(PathBuf::from("quotes.db")));
        assert_eq!(config.database.statement_timeout_secs, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn loads_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[database]\nstatement_timeout_secs = 0\n").unwrap();

        let config = ConfigLoader::load_from(&path).unwrap();
        assert_eq!(config.database.statement_timeout_secs, 0);
        assert!(config.database.path.is_none());
    }

    #[test]
    fn yaml_takes_precedence_over_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "").unwrap();
        std::fs::write(dir.path().join("config.yml"), "{}").unwrap();

        let loader = ConfigLoader::with_dir(dir.path());
        assert_eq!(loader.config_path().unwrap(), dir.path().join("config.yml"));
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "x=1").unwrap();

        let err = ConfigLoader::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_DATABASE_PATH, "/tmp/override.db"),
            (ENV_STATEMENT_TIMEOUT, "12"),
            (ENV_LOG_LEVEL, "trace"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/override.db")));
        assert_eq!(config.database.statement_timeout_secs, 12);
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn invalid_timeout_override_is_a_config_error() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == ENV_STATEMENT_TIMEOUT).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
