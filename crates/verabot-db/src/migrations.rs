use std::collections::HashSet;

use crate::error::MigrationError;
use crate::executor::SCHEMA_VERSIONS_TABLE;

/// Statements that may run concurrently with each other.
pub type Phase = &'static [&'static str];

/// A versioned schema change.
///
/// `up` and `down` are lists of phases applied in order. Every statement in
/// a phase is dispatched at once and the phase completes when all of them
/// have reported back. Put a statement in a later phase only when it needs
/// an earlier one to have finished, e.g. an index on a table created by the
/// same migration, or a parent table dropped after its children.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static [Phase],
    pub down: &'static [Phase],
}

impl Migration {
    /// All `up` statements in dispatch order.
    pub fn up_statements(&self) -> impl Iterator<Item = &'static str> + use<> {
        let up = self.up;
        up.iter().flat_map(|phase| phase.iter().copied())
    }

    /// All `down` statements in dispatch order.
    pub fn down_statements(&self) -> impl Iterator<Item = &'static str> + use<> {
        let down = self.down;
        down.iter().flat_map(|phase| phase.iter().copied())
    }
}

/// Sort migrations by version and check that versions start at 1, are
/// unique and have no gaps, and that no `down` touches the history table.
pub fn validate(mut migrations: Vec<Migration>) -> Result<Vec<Migration>, MigrationError> {
    migrations.sort_by_key(|m| m.version);

    let mut seen = HashSet::new();
    for m in &migrations {
        if m.version == 0 {
            return Err(MigrationError::InvalidMigrationSet(format!(
                "migration {:?} uses version 0; versions start at 1",
                m.description
            )));
        }
        if !seen.insert(m.version) {
            return Err(MigrationError::InvalidMigrationSet(format!(
                "duplicate version {}",
                m.version
            )));
        }
        if let Some(sql) = m
            .down_statements()
            .find(|sql| sql.to_lowercase().contains(SCHEMA_VERSIONS_TABLE))
        {
            return Err(MigrationError::InvalidMigrationSet(format!(
                "migration {} rolls back {SCHEMA_VERSIONS_TABLE}: {sql}",
                m.version
            )));
        }
    }

    for (expected, m) in (1u32..).zip(&migrations) {
        if m.version != expected {
            return Err(MigrationError::InvalidMigrationSet(format!(
                "missing version {expected} (next defined version is {})",
                m.version
            )));
        }
    }

    Ok(migrations)
}
