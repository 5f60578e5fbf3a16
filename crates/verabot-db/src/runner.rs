use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{MigrationError, StatementError};
use crate::executor::{Executor, SCHEMA_VERSIONS_SQL, SCHEMA_VERSIONS_TABLE, SchemaVersionRecord};
use crate::migrations::{Migration, Phase, validate};
use crate::schema;

/// Versions applied by a single `apply_all` call, in the order applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied_versions: Vec<u32>,
}

/// Versions undone by a single `rollback` call, highest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub rolled_back_versions: Vec<u32>,
}

/// A known migration together with its applied timestamp, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub version: u32,
    pub description: &'static str,
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

/// Applies migrations in ascending version order and rolls them back in
/// descending order, tracking progress in `schema_versions`.
///
/// The runner assumes it is the only writer to the schema while a run is in
/// progress. A failed migration is not undone: statements that already
/// succeeded stay applied and the version is not recorded.
pub struct MigrationRunner {
    migrations: Vec<Migration>,
    statement_timeout: Option<Duration>,
}

impl MigrationRunner {
    /// Build a runner over `migrations`. Input order does not matter; the
    /// set is sorted by version and must be unique and gap-free from 1.
    pub fn new(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        Ok(Self {
            migrations: validate(migrations)?,
            statement_timeout: None,
        })
    }

    /// Runner over VeraBot's built-in schema.
    pub fn builtin() -> Result<Self, MigrationError> {
        Self::new(schema::all())
    }

    /// Fail a migration when any single statement runs longer than
    /// `timeout` once it has the connection. `None` waits indefinitely.
    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Highest known version, or 0 for an empty set.
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    /// Apply every migration not yet recorded in `schema_versions`.
    pub async fn apply_all<E>(&self, executor: &E) -> Result<ApplyReport, MigrationError>
    where
        E: Executor + ?Sized,
    {
        executor.execute(SCHEMA_VERSIONS_SQL).await.map_err(|e| {
            MigrationError::History(format!("failed to create {SCHEMA_VERSIONS_TABLE}: {e}"))
        })?;

        let applied = self.applied_versions(executor).await?;
        let latest = self.latest_version();
        for version in applied.iter().filter(|v| **v > latest) {
            warn!("schema_versions contains version {version}, newer than any known migration");
        }

        let mut report = ApplyReport::default();
        for migration in &self.migrations {
            let version = migration.version;
            if applied.contains(&version) {
                debug!("migration {version} already applied, skipping");
                continue;
            }

            info!("applying migration {version}: {}", migration.description);
            self.run_phases(version, migration.up, true, executor)
                .await
                .map_err(|cause| match cause {
                    StatementError::TimedOut(timeout) => {
                        MigrationError::MigrationTimeout { version, timeout }
                    }
                    cause => MigrationError::MigrationFailed { version, cause },
                })?;

            executor
                .record_version(version, migration.description)
                .await
                .map_err(|cause| MigrationError::MigrationFailed { version, cause })?;

            report.applied_versions.push(version);
        }

        if report.applied_versions.is_empty() {
            info!("schema is up to date at version {latest}");
        } else {
            info!(
                "applied {} migration(s), schema now at version {latest}",
                report.applied_versions.len()
            );
        }
        Ok(report)
    }

    /// Undo every applied migration above `target_version`, highest first.
    /// `schema_versions` itself is kept.
    pub async fn rollback<E>(
        &self,
        executor: &E,
        target_version: u32,
    ) -> Result<RollbackReport, MigrationError>
    where
        E: Executor + ?Sized,
    {
        let applied = self.applied_versions(executor).await?;

        let known: HashSet<u32> = self.migrations.iter().map(|m| m.version).collect();
        if let Some(unknown) = applied
            .iter()
            .filter(|v| **v > target_version && !known.contains(*v))
            .max()
        {
            return Err(MigrationError::History(format!(
                "cannot roll back version {unknown}: no migration with that version is known"
            )));
        }

        let mut report = RollbackReport::default();
        for migration in self.migrations.iter().rev() {
            let version = migration.version;
            if version <= target_version || !applied.contains(&version) {
                continue;
            }

            info!("rolling back migration {version}: {}", migration.description);
            self.run_phases(version, migration.down, false, executor)
                .await
                .map_err(|cause| MigrationError::RollbackFailed { version, cause })?;

            executor
                .remove_version(version)
                .await
                .map_err(|cause| MigrationError::RollbackFailed { version, cause })?;

            report.rolled_back_versions.push(version);
        }

        info!(
            "rolled back {} migration(s) to version {target_version}",
            report.rolled_back_versions.len()
        );
        Ok(report)
    }

    /// Every known migration with its applied timestamp.
    pub async fn status<E>(&self, executor: &E) -> Result<Vec<MigrationStatus>, MigrationError>
    where
        E: Executor + ?Sized,
    {
        let applied: HashMap<u32, DateTime<Utc>> = self
            .applied_records(executor)
            .await?
            .into_iter()
            .map(|r| (r.version, r.applied_at))
            .collect();

        Ok(self
            .migrations
            .iter()
            .map(|m| MigrationStatus {
                version: m.version,
                description: m.description,
                applied_at: applied.get(&m.version).copied(),
            })
            .collect())
    }

    /// Known migrations that have not been applied yet.
    pub async fn pending<E>(&self, executor: &E) -> Result<Vec<Migration>, MigrationError>
    where
        E: Executor + ?Sized,
    {
        let applied = self.applied_versions(executor).await?;
        Ok(self
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .copied()
            .collect())
    }

    pub async fn applied_records<E>(
        &self,
        executor: &E,
    ) -> Result<Vec<SchemaVersionRecord>, MigrationError>
    where
        E: Executor + ?Sized,
    {
        executor.applied_records().await.map_err(|e| {
            MigrationError::History(format!("failed to read {SCHEMA_VERSIONS_TABLE}: {e}"))
        })
    }

    async fn applied_versions<E>(&self, executor: &E) -> Result<HashSet<u32>, MigrationError>
    where
        E: Executor + ?Sized,
    {
        Ok(self
            .applied_records(executor)
            .await?
            .into_iter()
            .map(|r| r.version)
            .collect())
    }

    /// Run `phases` in order. Within a phase every statement is dispatched
    /// before any is awaited, and the phase only fails once all of them have
    /// reported back.
    async fn run_phases<E>(
        &self,
        version: u32,
        phases: &[Phase],
        tolerate_existing: bool,
        executor: &E,
    ) -> Result<(), StatementError>
    where
        E: Executor + ?Sized,
    {
        for phase in phases {
            let results = join_all(phase.iter().map(|sql| self.run_statement(executor, sql))).await;

            let mut first_error = None;
            for (sql, result) in phase.iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(e) if tolerate_existing && e.is_already_exists() => {
                        debug!("migration {version}: treating as applied ({e}): {sql}");
                    }
                    Err(e) => {
                        warn!("migration {version}: statement failed ({e}): {sql}");
                        first_error.get_or_insert(e);
                    }
                }
            }

            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_statement<E>(&self, executor: &E, sql: &str) -> Result<(), StatementError>
    where
        E: Executor + ?Sized,
    {
        match self.statement_timeout {
            Some(limit) => executor.execute_with_timeout(sql, limit).await,
            None => executor.execute(sql).await,
        }
    }
}
