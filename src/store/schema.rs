//! SQLite schema for the entry store

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new entry schema v{}", SCHEMA_VERSION);
        conn.execute_batch(ENTRIES_SCHEMA)
            .map_err(|e| StoreError::Backend(format!("Failed to create entries table: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(StoreError::Backend(format!(
            "Database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Entry schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StoreError::Backend(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| StoreError::Backend(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| StoreError::Backend(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Entries table. `canonical_key` uniqueness is what makes concurrent inserts
/// across processes safe.
const ENTRIES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY NOT NULL,
    canonical_key TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    advisory TEXT NOT NULL,
    location TEXT NOT NULL,
    caution TEXT NOT NULL,
    trivia TEXT NOT NULL,
    sponsor_note TEXT NOT NULL,
    reliability INTEGER NOT NULL CHECK (reliability BETWEEN 0 AND 100),
    danger INTEGER NOT NULL CHECK (danger BETWEEN 0 AND 100),
    popularity INTEGER NOT NULL DEFAULT 0,
    category TEXT,
    cross_references_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_created ON entries(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_entries_popularity ON entries(popularity DESC);
"#;
