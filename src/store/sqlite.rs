//! SQLite entry store
//!
//! One connection behind a `Mutex`, driven from `spawn_blocking` so the
//! runtime never parks on disk I/O. When trigram support is enabled a
//! deterministic `similarity(a, b)` scalar function is registered on the
//! connection; otherwise the function is absent and
//! [`EntryStore::probe_similarity`] reports `Unsupported`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::schema;
use super::{Entry, EntryStore, MatchMode, NewEntry, ScoredEntry, StoreError};
use crate::canonical::CanonicalKey;
use crate::trigram;

/// Connection options
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteOptions {
    /// Register the trigram `similarity` function
    pub trigram: bool,
}

/// SQLite-backed [`EntryStore`]
pub struct SqliteEntryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEntryStore {
    /// Open or create the database file
    pub fn open(path: &Path, options: SqliteOptions) -> Result<Self, StoreError> {
        info!("Opening SQLite entry store at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| StoreError::Backend(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| StoreError::Backend(format!("Failed to set PRAGMA: {}", e)))?;

        Self::init(conn, options)
    }

    /// Open an in-memory database (dev mode and tests)
    pub fn open_in_memory(options: SqliteOptions) -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite entry store");

        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Backend(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::init(conn, options)
    }

    fn init(conn: Connection, options: SqliteOptions) -> Result<Self, StoreError> {
        if options.trigram {
            register_similarity(&conn)?;
        }
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("Lock poisoned: {}", e)))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Blocking task failed: {}", e)))?
    }
}

fn register_similarity(conn: &Connection) -> Result<(), StoreError> {
    conn.create_scalar_function(
        "similarity",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a: String = ctx.get(0)?;
            let b: String = ctx.get(1)?;
            Ok(trigram::similarity(&a, &b))
        },
    )
    .map_err(|e| StoreError::Backend(format!("Failed to register similarity: {}", e)))
}

// ============================================================================
// Row mapping
// ============================================================================

const ENTRY_COLUMNS: &str = "id, canonical_key, title, body, advisory, location, caution, trivia, \
     sponsor_note, reliability, danger, popularity, category, cross_references_json, \
     created_at, updated_at";

/// Raw column values, converted to an [`Entry`] outside the rusqlite callback
struct EntryRow {
    id: String,
    canonical_key: String,
    title: String,
    body: String,
    advisory: String,
    location: String,
    caution: String,
    trivia: String,
    sponsor_note: String,
    reliability: i64,
    danger: i64,
    popularity: i64,
    category: Option<String>,
    cross_references_json: String,
    created_at: String,
    updated_at: String,
}

impl EntryRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            canonical_key: row.get("canonical_key")?,
            title: row.get("title")?,
            body: row.get("body")?,
            advisory: row.get("advisory")?,
            location: row.get("location")?,
            caution: row.get("caution")?,
            trivia: row.get("trivia")?,
            sponsor_note: row.get("sponsor_note")?,
            reliability: row.get("reliability")?,
            danger: row.get("danger")?,
            popularity: row.get("popularity")?,
            category: row.get("category")?,
            cross_references_json: row.get("cross_references_json")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_entry(self) -> Result<Entry, StoreError> {
        let corrupt = |field: &str, e: String| {
            StoreError::Backend(format!("Corrupt {} in row {}: {}", field, self.id, e))
        };

        Ok(Entry {
            id: Uuid::parse_str(&self.id).map_err(|e| corrupt("id", e.to_string()))?,
            canonical_key: CanonicalKey::parse(&self.canonical_key)
                .map_err(|e| corrupt("canonical_key", e.to_string()))?,
            title: self.title.clone(),
            body: self.body.clone(),
            advisory: self.advisory.clone(),
            location: self.location.clone(),
            caution: self.caution.clone(),
            trivia: self.trivia.clone(),
            sponsor_note: self.sponsor_note.clone(),
            reliability: u8::try_from(self.reliability)
                .map_err(|e| corrupt("reliability", e.to_string()))?,
            danger: u8::try_from(self.danger).map_err(|e| corrupt("danger", e.to_string()))?,
            popularity: self.popularity.max(0) as u64,
            created_at: parse_timestamp(&self.created_at)
                .map_err(|e| corrupt("created_at", e))?,
            updated_at: parse_timestamp(&self.updated_at)
                .map_err(|e| corrupt("updated_at", e))?,
            category: self.category.clone(),
            cross_references: serde_json::from_str(&self.cross_references_json)
                .map_err(|e| corrupt("cross_references", e.to_string()))?,
        })
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    // Fixed-width so lexical order matches chronological order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

/// Collect `(row, score)` pairs, then convert
fn query_scored(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
    scored: bool,
) -> Result<Vec<ScoredEntry>, StoreError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| StoreError::Backend(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params, |row| {
            let score: Option<f64> = if scored { Some(row.get("score")?) } else { None };
            Ok((EntryRow::from_row(row)?, score))
        })
        .map_err(|e| StoreError::Backend(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Backend(format!("Row fetch failed: {}", e)))?;

    rows.into_iter()
        .map(|(row, score)| {
            Ok(ScoredEntry {
                entry: row.into_entry()?,
                score,
            })
        })
        .collect()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

// ============================================================================
// EntryStore
// ============================================================================

#[async_trait]
impl EntryStore for SqliteEntryStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get_by_key(&self, key: &CanonicalKey) -> Result<Option<Entry>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM entries WHERE canonical_key = ?1", ENTRY_COLUMNS);
            let mut found = query_scored(conn, &sql, &[&key], false)?;
            Ok(found.pop().map(|s| s.entry))
        })
        .await
    }

    async fn find_similar(
        &self,
        key: &CanonicalKey,
        mode: MatchMode,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        let key_str = key.to_string();
        let compact = key.compact();
        let limit = limit_param(limit);

        self.with_conn(move |conn| match mode {
            MatchMode::Exact => {
                let sql = format!(
                    "SELECT {} FROM entries \
                     WHERE canonical_key = ?1 OR REPLACE(canonical_key, '-', '') = ?2 \
                     ORDER BY (canonical_key = ?1) DESC, popularity DESC, canonical_key ASC \
                     LIMIT ?3",
                    ENTRY_COLUMNS
                );
                query_scored(conn, &sql, &[&key_str, &compact, &limit], false)
            }
            MatchMode::Substring => {
                let sql = format!(
                    "SELECT {} FROM entries \
                     WHERE instr(canonical_key, ?1) > 0 \
                        OR instr(REPLACE(canonical_key, '-', ''), ?2) > 0 \
                     ORDER BY (canonical_key = ?1) DESC, popularity DESC, canonical_key ASC \
                     LIMIT ?3",
                    ENTRY_COLUMNS
                );
                query_scored(conn, &sql, &[&key_str, &compact, &limit], false)
            }
            MatchMode::Similarity { threshold } => {
                let sql = format!(
                    "SELECT * FROM ( \
                         SELECT {}, MAX(similarity(?1, canonical_key), \
                                        similarity(?2, REPLACE(canonical_key, '-', ''))) AS score \
                         FROM entries \
                     ) \
                     WHERE score > ?3 \
                        OR instr(canonical_key, ?1) > 0 \
                        OR instr(REPLACE(canonical_key, '-', ''), ?2) > 0 \
                     ORDER BY (canonical_key = ?1) DESC, score DESC, popularity DESC, canonical_key ASC \
                     LIMIT ?4",
                    ENTRY_COLUMNS
                );
                query_scored(conn, &sql, &[&key_str, &compact, &threshold, &limit], true).map_err(
                    |e| match e {
                        StoreError::Backend(msg) if msg.contains("no such function") => {
                            StoreError::Unsupported(msg)
                        }
                        other => other,
                    },
                )
            }
        })
        .await
    }

    async fn insert(&self, entry: NewEntry) -> Result<Entry, StoreError> {
        let entry = entry.into_entry(Utc::now());

        self.with_conn(move |conn| {
            let cross_refs = serde_json::to_string(&entry.cross_references)
                .map_err(|e| StoreError::Backend(format!("Failed to encode cross references: {}", e)))?;

            let result = conn.execute(
                "INSERT INTO entries (id, canonical_key, title, body, advisory, location, caution, \
                 trivia, sponsor_note, reliability, danger, popularity, category, \
                 cross_references_json, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13, ?14, ?15)",
                params![
                    entry.id.to_string(),
                    entry.canonical_key.as_str(),
                    entry.title,
                    entry.body,
                    entry.advisory,
                    entry.location,
                    entry.caution,
                    entry.trivia,
                    entry.sponsor_note,
                    entry.reliability,
                    entry.danger,
                    entry.category,
                    cross_refs,
                    format_timestamp(entry.created_at),
                    format_timestamp(entry.updated_at),
                ],
            );

            match result {
                Ok(_) => {
                    debug!(key = %entry.canonical_key, id = %entry.id, "Inserted entry");
                    Ok(entry)
                }
                Err(e) if is_unique_violation(&e) => {
                    Err(StoreError::Conflict(entry.canonical_key.to_string()))
                }
                Err(e) => Err(StoreError::Backend(format!("Insert failed: {}", e))),
            }
        })
        .await
    }

    async fn increment_popularity(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE entries SET popularity = popularity + 1 WHERE id = ?1",
                    params![id.to_string()],
                )
                .map_err(|e| StoreError::Backend(format!("Update failed: {}", e)))?;

            if updated == 0 {
                return Err(StoreError::Backend(format!("Entry not found: {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Entry>, StoreError> {
        let limit = limit_param(limit);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM entries ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                ENTRY_COLUMNS
            );
            Ok(query_scored(conn, &sql, &[&limit], false)?
                .into_iter()
                .map(|s| s.entry)
                .collect())
        })
        .await
    }

    async fn list_popular(&self, limit: usize) -> Result<Vec<Entry>, StoreError> {
        let limit = limit_param(limit);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM entries ORDER BY popularity DESC, created_at DESC LIMIT ?1",
                ENTRY_COLUMNS
            );
            Ok(query_scored(conn, &sql, &[&limit], false)?
                .into_iter()
                .map(|s| s.entry)
                .collect())
        })
        .await
    }

    async fn probe_similarity(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT similarity('probe', 'probe')", [], |row| row.get::<_, f64>(0))
                .map(|_| ())
                .map_err(|e| StoreError::Unsupported(format!("similarity: {}", e)))
        })
        .await
    }
}
