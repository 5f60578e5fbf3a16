//! VeraBot's schema, one migration per version.
//!
//! `schema_versions` is created by the first migration but is never dropped
//! by any `down`, so history survives a full rollback.

use crate::executor::SCHEMA_VERSIONS_SQL;
use crate::migrations::Migration;

pub const QUOTES_SQL: &str = "CREATE TABLE IF NOT EXISTS quotes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id TEXT NOT NULL,
    author TEXT NOT NULL,
    content TEXT NOT NULL,
    added_by TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

pub const QUOTES_GUILD_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_quotes_guild ON quotes(guild_id, created_at)";

pub const CREATE_QUOTES: Migration = Migration {
    version: 1,
    description: "create schema_versions and quotes",
    up: &[&[SCHEMA_VERSIONS_SQL, QUOTES_SQL], &[QUOTES_GUILD_INDEX_SQL]],
    down: &[&[
        "DROP INDEX IF EXISTS idx_quotes_guild",
        "DROP TABLE IF EXISTS quotes",
    ]],
};

pub const QUOTE_RATINGS_SQL: &str = "CREATE TABLE IF NOT EXISTS quote_ratings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    quote_id INTEGER NOT NULL REFERENCES quotes(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
    rated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (quote_id, user_id)
)";

pub const QUOTE_RATINGS_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_quote_ratings_quote ON quote_ratings(quote_id)";

pub const CREATE_QUOTE_RATINGS: Migration = Migration {
    version: 2,
    description: "create quote_ratings",
    up: &[&[QUOTE_RATINGS_SQL], &[QUOTE_RATINGS_INDEX_SQL]],
    down: &[&[
        "DROP INDEX IF EXISTS idx_quote_ratings_quote",
        "DROP TABLE IF EXISTS quote_ratings",
    ]],
};

pub const TAGS_SQL: &str = "CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id TEXT NOT NULL,
    name TEXT NOT NULL COLLATE NOCASE,
    UNIQUE (guild_id, name)
)";

pub const QUOTE_TAGS_SQL: &str = "CREATE TABLE IF NOT EXISTS quote_tags (
    quote_id INTEGER NOT NULL REFERENCES quotes(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (quote_id, tag_id)
)";

pub const QUOTE_TAGS_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_quote_tags_tag ON quote_tags(tag_id)";

pub const CREATE_TAGS: Migration = Migration {
    version: 3,
    description: "create tags and quote_tags",
    up: &[&[TAGS_SQL, QUOTE_TAGS_SQL], &[QUOTE_TAGS_INDEX_SQL]],
    // quote_tags references tags, so it has to go first.
    down: &[
        &[
            "DROP INDEX IF EXISTS idx_quote_tags_tag",
            "DROP TABLE IF EXISTS quote_tags",
        ],
        &["DROP TABLE IF EXISTS tags"],
    ],
};

/// Older deployments added these columns by hand, so "duplicate column"
/// counts as success here.
pub const ADD_QUOTE_METADATA: Migration = Migration {
    version: 4,
    description: "add context and updated_at to quotes",
    up: &[&[
        "ALTER TABLE quotes ADD COLUMN context TEXT",
        "ALTER TABLE quotes ADD COLUMN updated_at TEXT",
    ]],
    down: &[&[
        "ALTER TABLE quotes DROP COLUMN context",
        "ALTER TABLE quotes DROP COLUMN updated_at",
    ]],
};

/// Every built-in migration in version order.
pub fn all() -> Vec<Migration> {
    vec![
        CREATE_QUOTES,
        CREATE_QUOTE_RATINGS,
        CREATE_TAGS,
        ADD_QUOTE_METADATA,
    ]
}
