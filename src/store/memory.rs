//! In-memory entry store
//!
//! DashMap keyed by canonical key, with an id index. Insert goes through the
//! map's entry API so duplicate keys conflict exactly as the SQLite unique
//! constraint does.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::{
    best_similarity, is_substring_match, is_variant_match, rank, Entry, EntryStore, MatchMode,
    NewEntry, ScoredEntry, StoreError,
};
use crate::canonical::CanonicalKey;

/// DashMap-backed [`EntryStore`]
pub struct MemoryEntryStore {
    by_key: DashMap<CanonicalKey, Entry>,
    ids: DashMap<Uuid, CanonicalKey>,
    similarity: bool,
}

impl MemoryEntryStore {
    /// Store without the similarity primitive
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            ids: DashMap::new(),
            similarity: false,
        }
    }

    /// Store that answers `Similarity` queries
    pub fn with_similarity() -> Self {
        Self {
            similarity: true,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn snapshot(&self) -> Vec<Entry> {
        self.by_key.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for MemoryEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_by_key(&self, key: &CanonicalKey) -> Result<Option<Entry>, StoreError> {
        Ok(self.by_key.get(key).map(|e| e.value().clone()))
    }

    async fn find_similar(
        &self,
        key: &CanonicalKey,
        mode: MatchMode,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        let mut candidates: Vec<ScoredEntry> = match mode {
            MatchMode::Exact => self
                .snapshot()
                .into_iter()
                .filter(|e| is_variant_match(key, &e.canonical_key))
                .map(|entry| ScoredEntry { entry, score: None })
                .collect(),
            MatchMode::Substring => self
                .snapshot()
                .into_iter()
                .filter(|e| is_substring_match(key, &e.canonical_key))
                .map(|entry| ScoredEntry { entry, score: None })
                .collect(),
            MatchMode::Similarity { threshold } => {
                if !self.similarity {
                    return Err(StoreError::Unsupported("similarity".to_string()));
                }
                self.snapshot()
                    .into_iter()
                    .filter_map(|entry| {
                        let score = best_similarity(key, &entry.canonical_key);
                        (score > threshold || is_substring_match(key, &entry.canonical_key))
                            .then_some(ScoredEntry {
                                entry,
                                score: Some(score),
                            })
                    })
                    .collect()
            }
        };

        rank(key, &mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn insert(&self, entry: NewEntry) -> Result<Entry, StoreError> {
        match self.by_key.entry(entry.canonical_key.clone()) {
            MapEntry::Occupied(occupied) => Err(StoreError::Conflict(occupied.key().to_string())),
            MapEntry::Vacant(vacant) => {
                let entry = entry.into_entry(Utc::now());
                self.ids.insert(entry.id, entry.canonical_key.clone());
                vacant.insert(entry.clone());
                debug!(key = %entry.canonical_key, id = %entry.id, "Inserted entry");
                Ok(entry)
            }
        }
    }

    async fn increment_popularity(&self, id: Uuid) -> Result<(), StoreError> {
        let key = self
            .ids
            .get(&id)
            .map(|k| k.value().clone())
            .ok_or_else(|| StoreError::Backend(format!("Entry not found: {}", id)))?;

        match self.by_key.get_mut(&key) {
            Some(mut entry) => {
                entry.popularity += 1;
                Ok(())
            }
            None => Err(StoreError::Backend(format!("Entry not found: {}", id))),
        }
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Entry>, StoreError> {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn list_popular(&self, limit: usize) -> Result<Vec<Entry>, StoreError> {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| {
            b.popularity
                .cmp(&a.popularity)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn probe_similarity(&self) -> Result<(), StoreError> {
        if self.similarity {
            Ok(())
        } else {
            Err(StoreError::Unsupported("similarity".to_string()))
        }
    }
}
