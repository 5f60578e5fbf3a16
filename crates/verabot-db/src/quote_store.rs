use std::path::Path;
use std::sync::MutexGuard;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::info;
use verabot_common::{Error, Result};

use crate::executor::{SqliteExecutor, parse_datetime};
use crate::runner::MigrationRunner;

/// Quotes, ratings and tags backing the bot's `/quote` commands.
pub struct QuoteStore {
    db: SqliteExecutor,
}

/// A persisted quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub id: i64,
    pub guild_id: String,
    pub author: String,
    pub content: String,
    pub added_by: String,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

const QUOTE_COLUMNS: &str =
    "q.id, q.guild_id, q.author, q.content, q.added_by, q.context, q.created_at, q.updated_at";

impl QuoteStore {
    /// Open the database at `db_path` and bring its schema up to date.
    pub async fn open(db_path: &Path) -> Result<Self> {
        info!("opening quote store at {}", db_path.display());
        let db = SqliteExecutor::open(db_path)?;
        Self::migrated(db).await
    }

    pub async fn in_memory() -> Result<Self> {
        Self::migrated(SqliteExecutor::in_memory()?).await
    }

    async fn migrated(db: SqliteExecutor) -> Result<Self> {
        MigrationRunner::builtin()?.apply_all(&db).await?;
        Ok(Self { db })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.connection()
    }

    pub fn add_quote(
        &self,
        guild_id: &str,
        author: &str,
        content: &str,
        added_by: &str,
    ) -> Result<i64> {
        if content.trim().is_empty() {
            return Err(Error::InvalidInput("quote text cannot be empty".into()));
        }

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO quotes (guild_id, author, content, added_by) VALUES (?1, ?2, ?3, ?4)",
            params![guild_id, author, content, added_by],
        )
        .map_err(|e| Error::Database(format!("failed to add quote: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_quote(&self, id: i64) -> Result<Option<QuoteRecord>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {QUOTE_COLUMNS} FROM quotes q WHERE q.id = ?1"),
            params![id],
            quote_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load quote {id}: {e}")))
    }

    /// Most recent quotes for a guild, newest first.
    pub fn list_quotes(&self, guild_id: &str, limit: usize) -> Result<Vec<QuoteRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {QUOTE_COLUMNS} FROM quotes q
                 WHERE q.guild_id = ?1
                 ORDER BY q.created_at DESC, q.id DESC
                 LIMIT ?2"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params![guild_id, limit as i64], quote_from_row)
            .map_err(|e| Error::Database(format!("failed to query quotes: {e}")))?;

        let mut quotes = Vec::new();
        for row in rows {
            let quote =
                row.map_err(|e| Error::Database(format!("failed to read quote row: {e}")))?;
            quotes.push(quote);
        }
        Ok(quotes)
    }

    pub fn set_context(&self, id: i64, context: Option<&str>) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE quotes SET context = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![context, id],
            )
            .map_err(|e| Error::Database(format!("failed to update quote: {e}")))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("quote {id}")));
        }
        Ok(())
    }

    /// Delete a quote along with its ratings and tag links. Returns whether
    /// the quote existed.
    pub fn delete_quote(&self, id: i64) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn
            .execute("DELETE FROM quotes WHERE id = ?1", params![id])
            .map_err(|e| Error::Database(format!("failed to delete quote: {e}")))?;
        Ok(changed > 0)
    }

    /// Record a 1-5 rating. A user rating the same quote again replaces
    /// their previous rating.
    pub fn rate_quote(&self, quote_id: i64, user_id: &str, rating: u8) -> Result<()> {
        if !(1..=5).contains(&rating) {
            return Err(Error::InvalidInput(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }

        let conn = self.connection()?;
        ensure_quote_exists(&conn, quote_id)?;
        conn.execute(
            "INSERT INTO quote_ratings (quote_id, user_id, rating) VALUES (?1, ?2, ?3)
             ON CONFLICT (quote_id, user_id)
             DO UPDATE SET rating = excluded.rating, rated_at = datetime('now')",
            params![quote_id, user_id, rating],
        )
        .map_err(|e| Error::Database(format!("failed to rate quote: {e}")))?;
        Ok(())
    }

    pub fn average_rating(&self, quote_id: i64) -> Result<Option<f64>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT AVG(rating) FROM quote_ratings WHERE quote_id = ?1",
            params![quote_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to average ratings: {e}")))
    }

    /// Attach a tag to a quote, creating the tag for the quote's guild if
    /// needed. Tag names are case-insensitive.
    pub fn tag_quote(&self, quote_id: i64, tag: &str) -> Result<()> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(Error::InvalidInput("tag cannot be empty".into()));
        }

        let conn = self.connection()?;
        let guild_id: String = conn
            .query_row(
                "SELECT guild_id FROM quotes WHERE id = ?1",
                params![quote_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load quote {quote_id}: {e}")))?
            .ok_or_else(|| Error::NotFound(format!("quote {quote_id}")))?;

        conn.execute(
            "INSERT OR IGNORE INTO tags (guild_id, name) VALUES (?1, ?2)",
            params![guild_id, tag],
        )
        .map_err(|e| Error::Database(format!("failed to create tag: {e}")))?;

        conn.execute(
            "INSERT OR IGNORE INTO quote_tags (quote_id, tag_id)
             SELECT ?1, id FROM tags WHERE guild_id = ?2 AND name = ?3",
            params![quote_id, guild_id, tag],
        )
        .map_err(|e| Error::Database(format!("failed to tag quote: {e}")))?;
        Ok(())
    }

    pub fn quotes_by_tag(&self, guild_id: &str, tag: &str) -> Result<Vec<QuoteRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {QUOTE_COLUMNS} FROM quotes q
                 JOIN quote_tags qt ON qt.quote_id = q.id
                 JOIN tags t ON t.id = qt.tag_id
                 WHERE t.guild_id = ?1 AND t.name = ?2
                 ORDER BY q.id ASC"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params![guild_id, tag.trim()], quote_from_row)
            .map_err(|e| Error::Database(format!("failed to query tagged quotes: {e}")))?;

        let mut quotes = Vec::new();
        for row in rows {
            let quote =
                row.map_err(|e| Error::Database(format!("failed to read quote row: {e}")))?;
            quotes.push(quote);
        }
        Ok(quotes)
    }

    pub fn quote_count(&self) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM quotes", [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to count quotes: {e}")))?;
        Ok(count as usize)
    }
}

fn ensure_quote_exists(conn: &Connection, quote_id: i64) -> Result<()> {
    let exists: bool = conn
        .query_row(
            "SELECT count(*) > 0 FROM quotes WHERE id = ?1",
            params![quote_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to look up quote: {e}")))?;
    if !exists {
        return Err(Error::NotFound(format!("quote {quote_id}")));
    }
    Ok(())
}

fn quote_from_row(row: &Row<'_>) -> rusqlite::Result<QuoteRecord> {
    Ok(QuoteRecord {
        id: row.get(0)?,
        guild_id: row.get(1)?,
        author: row.get(2)?,
        content: row.get(3)?,
        added_by: row.get(4)?,
        context: row.get(5)?,
        created_at: parse_datetime(row.get::<_, String>(6)?),
        updated_at: row.get::<_, Option<String>>(7)?.map(parse_datetime),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrationError;

    #[tokio::test]
    async fn add_and_get_quote_round_trip() {
        let store = QuoteStore::in_memory().await.unwrap();
        let id = store
            .add_quote("guild-1", "Vera", "Ship it.", "user-1")
            .unwrap();

        let quote = store.get_quote(id).unwrap().unwrap();
        assert_eq!(quote.guild_id, "guild-1");
        assert_eq!(quote.author, "Vera");
        assert_eq!(quote.content, "Ship it.");
        assert_eq!(quote.added_by, "user-1");
        assert!(quote.context.is_none());
        assert!(quote.updated_at.is_none());
    }

    #[tokio::test]
    async fn get_missing_quote_returns_none() {
        let store = QuoteStore::in_memory().await.unwrap();
        assert!(store.get_quote(42).unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_quote_is_rejected() {
        let store = QuoteStore::in_memory().await.unwrap();
        let err = store.add_quote("g", "a", "   ", "u").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn list_quotes_is_scoped_and_limited() {
        let store = QuoteStore::in_memory().await.unwrap();
        for i in 0..5 {
            store
                .add_quote("guild-1", "a", &format!("quote {i}"), "u")
                .unwrap();
        }
        store.add_quote("guild-2", "b", "elsewhere", "u").unwrap();

        let quotes = store.list_quotes("guild-1", 3).unwrap();
        assert_eq!(quotes.len(), 3);
        assert_eq!(quotes[0].content, "quote 4");
        assert!(quotes.iter().all(|q| q.guild_id == "guild-1"));
        assert_eq!(store.quote_count().unwrap(), 6);
    }

    #[tokio::test]
    async fn set_context_marks_quote_updated() {
        let store = QuoteStore::in_memory().await.unwrap();
        let id = store.add_quote("g", "a", "text", "u").unwrap();

        store.set_context(id, Some("said during standup")).unwrap();
        let quote = store.get_quote(id).unwrap().unwrap();
        assert_eq!(quote.context.as_deref(), Some("said during standup"));
        assert!(quote.updated_at.is_some());

        assert!(matches!(
            store.set_context(999, None).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn ratings_upsert_per_user_and_average() {
        let store = QuoteStore::in_memory().await.unwrap();
        let id = store.add_quote("g", "a", "text", "u").unwrap();
        assert!(store.average_rating(id).unwrap().is_none());

        store.rate_quote(id, "alice", 5).unwrap();
        store.rate_quote(id, "bob", 2).unwrap();
        store.rate_quote(id, "bob", 3).unwrap();

        assert_eq!(store.average_rating(id).unwrap(), Some(4.0));
    }

    #[tokio::test]
    async fn rating_validates_range_and_quote() {
        let store = QuoteStore::in_memory().await.unwrap();
        let id = store.add_quote("g", "a", "text", "u").unwrap();

        assert!(matches!(
            store.rate_quote(id, "alice", 0).unwrap_err(),
            Error::InvalidInput(_)
        ));
        assert!(matches!(
            store.rate_quote(id, "alice", 6).unwrap_err(),
            Error::InvalidInput(_)
        ));
        assert!(matches!(
            store.rate_quote(id + 100, "alice", 3).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn tags_are_case_insensitive_per_guild() {
        let store = QuoteStore::in_memory().await.unwrap();
        let first = store.add_quote("g", "a", "one", "u").unwrap();
        let second = store.add_quote("g", "a", "two", "u").unwrap();
        let other = store.add_quote("h", "a", "three", "u").unwrap();

        store.tag_quote(first, "Funny").unwrap();
        store.tag_quote(second, "funny").unwrap();
        store.tag_quote(second, "funny").unwrap();
        store.tag_quote(other, "funny").unwrap();

        let tagged: Vec<i64> = store
            .quotes_by_tag("g", "FUNNY")
            .unwrap()
            .iter()
            .map(|q| q.id)
            .collect();
        assert_eq!(tagged, vec![first, second]);
    }

    #[tokio::test]
    async fn delete_quote_cascades() {
        let store = QuoteStore::in_memory().await.unwrap();
        let id = store.add_quote("g", "a", "text", "u").unwrap();
        store.rate_quote(id, "alice", 4).unwrap();
        store.tag_quote(id, "gone").unwrap();

        assert!(store.delete_quote(id).unwrap());
        assert!(!store.delete_quote(id).unwrap());
        assert!(store.average_rating(id).unwrap().is_none());
        assert!(store.quotes_by_tag("g", "gone").unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_reports_the_failing_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verabot.db");
        // a hand-made quotes table without guild_id breaks the index in version 1
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE quotes (id INTEGER PRIMARY KEY)")
            .unwrap();

        let err = match QuoteStore::open(&path).await {
            Ok(_) => panic!("open should fail on a conflicting schema"),
            Err(e) => e,
        };
        let Error::Migration(source) = &err else {
            panic!("expected a migration error, got {err:?}");
        };
        let migration = source
            .downcast_ref::<MigrationError>()
            .expect("source is a MigrationError");
        assert!(matches!(
            migration,
            MigrationError::MigrationFailed { version: 1, .. }
        ));
        assert!(err.to_string().contains("migration 1 failed"));
    }

    #[tokio::test]
    async fn open_creates_schema_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verabot.db");

        let store = QuoteStore::open(&path).await.unwrap();
        store.add_quote("g", "a", "persisted", "u").unwrap();
        drop(store);

        let reopened = QuoteStore::open(&path).await.unwrap();
        assert_eq!(reopened.quote_count().unwrap(), 1);
    }
}
