use std::time::Duration;

use thiserror::Error;

/// Outcome of a single failed statement, classified so the runner can tell
/// additive no-ops apart from real failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    /// The object a creation statement targets is already there: a table,
    /// an index, or a column added by `ALTER TABLE ... ADD COLUMN`.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The statement held the connection longer than the allowed limit and
    /// was interrupted.
    #[error("statement timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(String),
}

impl StatementError {
    /// Classify a raw SQLite error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("already exists") || lower.contains("duplicate column name") {
            Self::AlreadyExists(message)
        } else {
            Self::Failed(message)
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl From<rusqlite::Error> for StatementError {
    fn from(e: rusqlite::Error) -> Self {
        Self::classify(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("migration {version} failed: {cause}")]
    MigrationFailed { version: u32, cause: StatementError },

    #[error("rollback of migration {version} failed: {cause}")]
    RollbackFailed { version: u32, cause: StatementError },

    #[error("migration {version} timed out after {}s", .timeout.as_secs_f64())]
    MigrationTimeout { version: u32, timeout: Duration },

    #[error("invalid migration set: {0}")]
    InvalidMigrationSet(String),

    #[error("schema history error: {0}")]
    History(String),
}

impl MigrationError {
    /// The version a failure is attributed to, if any.
    pub fn version(&self) -> Option<u32> {
        match self {
            Self::MigrationFailed { version, .. }
            | Self::RollbackFailed { version, .. }
            | Self::MigrationTimeout { version, .. } => Some(*version),
            Self::InvalidMigrationSet(_) | Self::History(_) => None,
        }
    }
}

impl From<MigrationError> for verabot_common::Error {
    fn from(e: MigrationError) -> Self {
        verabot_common::Error::Migration(Box::new(e))
    }
}
