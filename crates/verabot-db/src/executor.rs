use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use verabot_common::{Error, Result};

use crate::error::StatementError;

/// Table holding one row per applied migration version.
pub const SCHEMA_VERSIONS_TABLE: &str = "schema_versions";

pub const SCHEMA_VERSIONS_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL UNIQUE,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// A row of the applied-history table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersionRecord {
    pub version: u32,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// Handle to a relational store that migrations run against.
///
/// Implementations must be safe to call concurrently: the runner issues every
/// statement of a phase before awaiting any of them.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a single DDL/DML statement.
    async fn execute(&self, sql: &str) -> std::result::Result<(), StatementError>;

    /// Execute a statement, failing with `StatementError::TimedOut` when it
    /// runs longer than `limit`. The default waits on `execute` from the
    /// moment of the call; implementations that queue statements should
    /// start the clock only once the statement actually runs.
    async fn execute_with_timeout(
        &self,
        sql: &str,
        limit: Duration,
    ) -> std::result::Result<(), StatementError> {
        match tokio::time::timeout(limit, self.execute(sql)).await {
            Ok(result) => result,
            Err(_) => Err(StatementError::TimedOut(limit)),
        }
    }

    /// Applied history ordered by version. Empty when the history table does
    /// not exist yet.
    async fn applied_records(
        &self,
    ) -> std::result::Result<Vec<SchemaVersionRecord>, StatementError>;

    async fn record_version(
        &self,
        version: u32,
        description: &str,
    ) -> std::result::Result<(), StatementError>;

    async fn remove_version(&self, version: u32) -> std::result::Result<(), StatementError>;
}

/// `Executor` over a single shared SQLite connection. Statements run on the
/// blocking pool and are serialized by the connection mutex.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the underlying connection for synchronous use.
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("database lock poisoned".into()))
    }

    /// Whether a table (or any schema object) named `name` exists.
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.connection()?;
        table_exists(&conn, name)
            .map_err(|e| Error::Database(format!("failed to inspect schema: {e}")))
    }

    /// Names of user tables, excluding SQLite internals, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to list tables: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read table name: {e}")))?;
        Ok(names)
    }

    async fn with_connection<T, F>(&self, f: F) -> std::result::Result<T, StatementError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> std::result::Result<T, StatementError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StatementError::Failed("database lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StatementError::Failed(format!("statement task failed: {e}")))?
    }
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn execute(&self, sql: &str) -> std::result::Result<(), StatementError> {
        let sql = sql.to_owned();
        self.with_connection(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
    }

    /// The clock starts once the connection is locked, so time spent queued
    /// behind sibling statements does not count. On expiry the statement is
    /// interrupted and SQLite rolls it back.
    async fn execute_with_timeout(
        &self,
        sql: &str,
        limit: Duration,
    ) -> std::result::Result<(), StatementError> {
        let sql = sql.to_owned();
        let runtime = tokio::runtime::Handle::current();
        self.with_connection(move |conn| {
            let interrupt = conn.get_interrupt_handle();
            let expired = Arc::new(AtomicBool::new(false));
            let watchdog = {
                let expired = Arc::clone(&expired);
                runtime.spawn(async move {
                    tokio::time::sleep(limit).await;
                    expired.store(true, Ordering::SeqCst);
                    interrupt.interrupt();
                })
            };

            let result = conn.execute_batch(&sql);
            watchdog.abort();

            match result {
                Ok(()) => Ok(()),
                Err(_) if expired.load(Ordering::SeqCst) => {
                    warn!("statement interrupted after {limit:?}");
                    Err(StatementError::TimedOut(limit))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn applied_records(
        &self,
    ) -> std::result::Result<Vec<SchemaVersionRecord>, StatementError> {
        self.with_connection(|conn| {
            if !table_exists(conn, SCHEMA_VERSIONS_TABLE)? {
                return Ok(Vec::new());
            }

            let mut stmt = conn.prepare(
                "SELECT version, description, applied_at
                 FROM schema_versions
                 ORDER BY version ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SchemaVersionRecord {
                    version: row.get(0)?,
                    description: row.get(1)?,
                    applied_at: parse_datetime(row.get::<_, String>(2)?),
                })
            })?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn record_version(
        &self,
        version: u32,
        description: &str,
    ) -> std::result::Result<(), StatementError> {
        let description = description.to_owned();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO schema_versions (version, description) VALUES (?1, ?2)",
                params![version, description],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_version(&self, version: u32) -> std::result::Result<(), StatementError> {
        self.with_connection(move |conn| {
            conn.execute(
                "DELETE FROM schema_versions WHERE version = ?1",
                params![version],
            )?;
            Ok(())
        })
        .await
    }
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )
}

pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // SQLite datetime('now') produces "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applied_records_empty_without_history_table() {
        let db = SqliteExecutor::in_memory().unwrap();
        assert!(db.applied_records().await.unwrap().is_empty());
        assert!(!db.table_exists(SCHEMA_VERSIONS_TABLE).unwrap());
    }

    #[tokio::test]
    async fn record_and_remove_versions() {
        let db = SqliteExecutor::in_memory().unwrap();
        db.execute(SCHEMA_VERSIONS_SQL).await.unwrap();

        db.record_version(2, "second").await.unwrap();
        db.record_version(1, "first").await.unwrap();

        let records = db.applied_records().await.unwrap();
        let versions: Vec<u32> = records.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(records[0].description, "first");

        db.remove_version(1).await.unwrap();
        let records = db.applied_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, 2);
    }

    #[tokio::test]
    async fn duplicate_version_is_rejected() {
        let db = SqliteExecutor::in_memory().unwrap();
        db.execute(SCHEMA_VERSIONS_SQL).await.unwrap();
        db.record_version(1, "first").await.unwrap();

        let err = db.record_version(1, "again").await.unwrap_err();
        assert!(matches!(err, StatementError::Failed(_)));
    }

    #[tokio::test]
    async fn execute_classifies_existing_objects() {
        let db = SqliteExecutor::in_memory().unwrap();
        db.execute("CREATE TABLE t (a TEXT)").await.unwrap();

        let err = db.execute("CREATE TABLE t (a TEXT)").await.unwrap_err();
        assert!(err.is_already_exists());

        let err = db.execute("INSERT INTO missing VALUES (1)").await.unwrap_err();
        assert!(!err.is_already_exists());
    }

    #[tokio::test]
    async fn queued_statements_only_time_their_own_execution() {
        let db = SqliteExecutor::in_memory().unwrap();
        let limit = Duration::from_millis(100);

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let db = db.clone();
            std::thread::spawn(move || {
                let _guard = db.connection().unwrap();
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(400));
            })
        };
        locked_rx.recv().unwrap();

        // Each statement waits well past the limit for the connection but
        // runs in a fraction of it.
        let results = futures::future::join_all([
            db.execute_with_timeout("CREATE TABLE a (x)", limit),
            db.execute_with_timeout("CREATE TABLE b (x)", limit),
            db.execute_with_timeout("CREATE TABLE c (x)", limit),
        ])
        .await;
        holder.join().unwrap();

        for result in results {
            result.unwrap();
        }
        assert_eq!(db.table_names().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn long_statement_is_interrupted_and_not_committed() {
        let db = SqliteExecutor::in_memory().unwrap();
        let limit = Duration::from_millis(100);

        let err = db
            .execute_with_timeout(
                "CREATE TABLE endless AS
                 WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n)
                 SELECT count(*) AS total FROM n",
                limit,
            )
            .await
            .unwrap_err();
        assert_eq!(err, StatementError::TimedOut(limit));
        assert!(!db.table_exists("endless").unwrap());

        // the connection is usable again once the interrupt has landed
        db.execute_with_timeout("CREATE TABLE after (x)", limit)
            .await
            .unwrap();
        assert!(db.table_exists("after").unwrap());
    }

    #[test]
    fn parse_datetime_accepts_sqlite_format() {
        let dt = parse_datetime("2024-05-01 12:30:00".to_string());
        assert_eq!(dt.to_rfc3339(), "2024-05-01T12:30:00+00:00");
    }

    #[test]
    fn table_names_skip_sqlite_internals() {
        let db = SqliteExecutor::in_memory().unwrap();
        db.connection()
            .unwrap()
            .execute_batch(
                "CREATE TABLE b (id INTEGER PRIMARY KEY AUTOINCREMENT); CREATE TABLE a (x);",
            )
            .unwrap();
        assert_eq!(db.table_names().unwrap(), vec!["a", "b"]);
    }
}
