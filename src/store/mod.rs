//! Entry storage
//!
//! [`EntryStore`] is the single source of truth for generated entries. Any
//! backend must:
//!
//! - enforce uniqueness of `canonical_key` itself, independent of the
//!   in-process generation lock (duplicate inserts fail with
//!   [`StoreError::Conflict`]),
//! - make `insert` the only creation path and never expose a partially written
//!   entry,
//! - apply popularity increments as commutative counter updates.
//!
//! The trigram similarity primitive is optional. Callers find out whether a
//! backend has it through [`EntryStore::probe_similarity`] rather than
//! assuming it.
//!
//! ## Backends
//!
//! - [`SqliteEntryStore`] - durable, WAL-mode SQLite
//! - [`MemoryEntryStore`] - DashMap-backed, for dev mode and tests

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryEntryStore;
pub use sqlite::{SqliteEntryStore, SqliteOptions};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::CanonicalKey;
use crate::synth::StructuredContent;
use crate::types::SearchError;

// ============================================================================
// Errors
// ============================================================================

/// Storage-level errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// An entry with this canonical key already exists
    #[error("Entry already exists: {0}")]
    Conflict(String),

    /// The backend lacks an optional primitive (e.g. similarity)
    #[error("Unsupported by backend: {0}")]
    Unsupported(String),

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for SearchError {
    fn from(e: StoreError) -> Self {
        SearchError::StorageFailed(e.to_string())
    }
}

// ============================================================================
// Entries
// ============================================================================

/// A generated entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: Uuid,
    pub canonical_key: CanonicalKey,
    /// Display title derived from the key
    pub title: String,
    pub body: String,
    pub advisory: String,
    pub location: String,
    pub caution: String,
    pub trivia: String,
    pub sponsor_note: String,
    /// 0-100, fixed at creation
    pub reliability: u8,
    /// 0-100, fixed at creation
    pub danger: u8,
    /// Lookup counter; only ever increases
    pub popularity: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub category: Option<String>,
    #[serde(default)]
    pub cross_references: Vec<CanonicalKey>,
}

/// Entry about to be inserted
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub canonical_key: CanonicalKey,
    pub title: String,
    pub content: StructuredContent,
}

impl NewEntry {
    /// Build from validated synthesizer output
    pub fn new(canonical_key: CanonicalKey, content: StructuredContent) -> Self {
        let title = title_case(&canonical_key.topic());
        Self {
            canonical_key,
            title,
            content,
        }
    }

    /// Materialize with a fresh id and timestamps
    pub fn into_entry(self, now: DateTime<Utc>) -> Entry {
        let c = self.content;
        Entry {
            id: Uuid::new_v4(),
            canonical_key: self.canonical_key,
            title: self.title,
            body: c.body,
            advisory: c.advisory,
            location: c.location,
            caution: c.caution,
            trivia: c.trivia,
            sponsor_note: c.sponsor_note,
            reliability: c.reliability,
            danger: c.danger,
            popularity: 0,
            created_at: now,
            updated_at: now,
            category: c.category,
            cross_references: c.cross_references,
        }
    }
}

fn title_case(topic: &str) -> String {
    topic
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Matching
// ============================================================================

/// How `find_similar` selects and ranks candidates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchMode {
    /// Exact key or separator-insensitive variant; exact first, then popularity
    Exact,
    /// Exact, variant or substring containment; ranked by popularity
    Substring,
    /// Trigram similarity above `threshold` or substring containment; ranked
    /// by similarity, then popularity
    Similarity { threshold: f64 },
}

/// Candidate returned by `find_similar`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredEntry {
    #[serde(flatten)]
    pub entry: Entry,
    /// Trigram similarity, when the backend computed one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Exact key or same key with separators removed
pub fn is_variant_match(query: &CanonicalKey, candidate: &CanonicalKey) -> bool {
    query == candidate || query.compact() == candidate.compact()
}

/// Candidate contains the query, with or without separators
pub fn is_substring_match(query: &CanonicalKey, candidate: &CanonicalKey) -> bool {
    candidate.as_str().contains(query.as_str()) || candidate.compact().contains(&query.compact())
}

/// Best similarity across the hyphenated and compact forms
pub fn best_similarity(query: &CanonicalKey, candidate: &CanonicalKey) -> f64 {
    let direct = crate::trigram::similarity(query.as_str(), candidate.as_str());
    let compact = crate::trigram::similarity(&query.compact(), &candidate.compact());
    direct.max(compact)
}

/// Order candidates: exact key first, then score (when present) desc, then
/// popularity desc
pub fn rank(query: &CanonicalKey, candidates: &mut [ScoredEntry]) {
    candidates.sort_by(|a, b| {
        let exact_a = a.entry.canonical_key == *query;
        let exact_b = b.entry.canonical_key == *query;
        let by_score = match (a.score, b.score) {
            (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        };
        exact_b
            .cmp(&exact_a)
            .then(by_score)
            .then_with(|| b.entry.popularity.cmp(&a.entry.popularity))
            .then_with(|| a.entry.canonical_key.cmp(&b.entry.canonical_key))
    });
}

// ============================================================================
// Store trait
// ============================================================================

/// Durable keyed storage for entries
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Short backend name for diagnostics
    fn backend(&self) -> &'static str;

    /// Fetch by exact canonical key
    async fn get_by_key(&self, key: &CanonicalKey) -> Result<Option<Entry>, StoreError>;

    /// Candidates for `key` under `mode`, ordered best first
    async fn find_similar(
        &self,
        key: &CanonicalKey,
        mode: MatchMode,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, StoreError>;

    /// Insert a new entry; `Conflict` if the key exists
    async fn insert(&self, entry: NewEntry) -> Result<Entry, StoreError>;

    /// Add one to an entry's popularity
    async fn increment_popularity(&self, id: Uuid) -> Result<(), StoreError>;

    /// Most recently created entries
    async fn list_recent(&self, limit: usize) -> Result<Vec<Entry>, StoreError>;

    /// Most popular entries
    async fn list_popular(&self, limit: usize) -> Result<Vec<Entry>, StoreError>;

    /// Ok if the trigram similarity primitive is available
    async fn probe_similarity(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::canonical::canonicalize;

    pub fn content(body: &str) -> StructuredContent {
        StructuredContent {
            body: body.to_string(),
            advisory: "Don't panic".to_string(),
            location: "Outer Eastern Rim".to_string(),
            caution: "Mostly harmless".to_string(),
            trivia: "Popular at parties".to_string(),
            sponsor_note: "Brought to you by Sirius Cybernetics".to_string(),
            reliability: 80,
            danger: 10,
            category: None,
            cross_references: vec![],
        }
    }

    pub fn new_entry(key: &str) -> NewEntry {
        NewEntry::new(canonicalize(key).unwrap(), content(&format!("About {}", key)))
    }

    /// Insert and bump popularity to `popularity`
    pub async fn seed(store: &dyn EntryStore, key: &str, popularity: u64) -> Entry {
        let entry = store.insert(new_entry(key)).await.unwrap();
        for _ in 0..popularity {
            store.increment_popularity(entry.id).await.unwrap();
        }
        store.get_by_key(&entry.canonical_key).await.unwrap().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;

    fn key(s: &str) -> CanonicalKey {
        canonicalize(s).unwrap()
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("pan galactic gargle blaster"), "Pan Galactic Gargle Blaster");
        assert_eq!(title_case("42"), "42");
    }

    #[test]
    fn test_variant_and_substring_matching() {
        assert!(is_variant_match(&key("gargle blaster"), &key("gargle-blaster")));
        assert!(is_variant_match(&key("gargleblaster"), &key("gargle-blaster")));
        assert!(!is_variant_match(&key("gargle"), &key("gargle-blaster")));

        assert!(is_substring_match(&key("gargle blaster"), &key("pan-galactic-gargle-blaster")));
        assert!(is_substring_match(&key("galacticgargle"), &key("pan-galactic-gargle-blaster")));
        assert!(!is_substring_match(&key("towel"), &key("babel-fish")));
    }

    #[test]
    fn test_rank_by_score_then_popularity() {
        let now = Utc::now();
        let make = |k: &str, pop: u64, score: Option<f64>| {
            let mut entry = test_support::new_entry(k).into_entry(now);
            entry.popularity = pop;
            ScoredEntry { entry, score }
        };

        let mut scored = vec![
            make("pan-galactic-gargle-blaster", 10, Some(0.57)),
            make("gargle-blaster", 100, Some(1.0)),
            make("gargle-blaster-lite", 500, Some(0.57)),
        ];
        rank(&key("gargle blaster"), &mut scored);
        let keys: Vec<_> = scored.iter().map(|s| s.entry.canonical_key.to_string()).collect();
        assert_eq!(
            keys,
            vec!["gargle-blaster", "gargle-blaster-lite", "pan-galactic-gargle-blaster"]
        );

        let mut unscored = vec![make("a-1", 1, None), make("a-2", 50, None)];
        rank(&key("a"), &mut unscored);
        assert_eq!(unscored[0].entry.canonical_key.as_str(), "a-2");

        // Exact key wins over a more popular variant
        let mut exact = vec![make("babelfish", 90, None), make("babel-fish", 1, None)];
        rank(&key("babel fish"), &mut exact);
        assert_eq!(exact[0].entry.canonical_key.as_str(), "babel-fish");
    }
}
