//! Schema migration for the cache store.
//!
//! The initial version is a single idempotent SQL script; future versions
//! append further scripts keyed by `schema_version`.

use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Initial schema: cache entries, task queue, invalidation audit log,
/// aggregated stats, account-class map, and version bookkeeping.
const INIT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key       TEXT PRIMARY KEY,
    account_id      TEXT NOT NULL,
    resource_type   TEXT NOT NULL,
    resource_id     TEXT,
    data_json       BLOB NOT NULL,
    is_compressed   INTEGER NOT NULL DEFAULT 0,
    data_size_bytes INTEGER NOT NULL,
    created_at      REAL NOT NULL,
    accessed_at     REAL NOT NULL,
    fresh_until     REAL NOT NULL,
    expires_at      REAL NOT NULL,
    hit_count       INTEGER NOT NULL DEFAULT 0,
    etag            TEXT,
    version         INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_cache_account_resource ON cache_entries (account_id, resource_type);
CREATE INDEX IF NOT EXISTS idx_cache_accessed ON cache_entries (accessed_at);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries (expires_at);
CREATE INDEX IF NOT EXISTS idx_cache_account_fresh ON cache_entries (account_id, fresh_until);

CREATE TABLE IF NOT EXISTS cache_tasks (
    task_id         TEXT PRIMARY KEY,
    account_id      TEXT NOT NULL,
    operation       TEXT NOT NULL,
    parameters_json TEXT,
    priority        INTEGER NOT NULL DEFAULT 5,
    status          TEXT NOT NULL DEFAULT 'queued',
    retry_count     INTEGER NOT NULL DEFAULT 0,
    created_at      REAL NOT NULL,
    started_at      REAL,
    completed_at    REAL,
    result_json     TEXT,
    last_error      TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status_priority ON cache_tasks (status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_account ON cache_tasks (account_id);
CREATE INDEX IF NOT EXISTS idx_tasks_created ON cache_tasks (created_at);

CREATE TABLE IF NOT EXISTS cache_invalidation (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id          TEXT NOT NULL,
    pattern             TEXT NOT NULL,
    reason              TEXT NOT NULL,
    invalidated_at      REAL NOT NULL,
    entries_invalidated INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_invalidation_account_time ON cache_invalidation (account_id, invalidated_at);

CREATE TABLE IF NOT EXISTS cache_stats (
    period      TEXT PRIMARY KEY,
    hits        INTEGER NOT NULL DEFAULT 0,
    misses      INTEGER NOT NULL DEFAULT 0,
    entries     INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    updated_at  REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stats_period ON cache_stats (period);

CREATE TABLE IF NOT EXISTS account_classes (
    account_id    TEXT PRIMARY KEY,
    account_class TEXT NOT NULL,
    detected_at   REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at  REAL NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, description, applied_at)
VALUES (1, 'Initial cache system schema', strftime('%s', 'now'));

INSERT OR IGNORE INTO cache_stats (period, hits, misses, entries, total_bytes, updated_at)
VALUES ('all_time', 0, 0, 0, 0, strftime('%s', 'now'));
"#;

/// Apply all pending migrations. Safe to call on every startup.
pub fn run(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(INIT_SCHEMA)?;

    let version: i64 =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    log::info!("Cache schema at version {}", version);

    Ok(())
}
