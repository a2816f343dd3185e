//! Similarity resolver
//!
//! Resolves a canonical key against stored entries using the best matching
//! tier the store supports. The store's trigram primitive is probed once;
//! the outcome is cached for the life of the resolver, so a store without it
//! is never probed again.
//!
//! | Capability      | Non-exact lookups                               | Exact lookups    |
//! |-----------------|-------------------------------------------------|------------------|
//! | `Trigram`       | similarity > threshold or substring, by score   | exact or variant |
//! | `SubstringOnly` | exact, variant or substring, by popularity      | exact or variant |

use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::canonical::CanonicalKey;
use crate::store::{Entry, EntryStore, MatchMode, ScoredEntry};
use crate::trigram::DEFAULT_THRESHOLD;
use crate::types::Result;

/// Matching tier available on the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityCapability {
    Trigram,
    SubstringOnly,
}

/// Resolver configuration
#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    /// Minimum trigram similarity for a candidate
    pub threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Resolution statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolverStats {
    /// Total lookups
    pub lookups: u64,
    /// Single-result lookups that found an entry
    pub hits: u64,
    /// Single-result lookups that found nothing
    pub misses: u64,
    /// Popularity increments that failed (logged, not surfaced)
    pub increment_failures: u64,
    /// Average lookup time in ms
    pub avg_lookup_ms: f64,
}

/// Capability-aware lookup over an [`EntryStore`]
pub struct SimilarityResolver {
    store: Arc<dyn EntryStore>,
    config: ResolverConfig,
    capability: OnceCell<SimilarityCapability>,
    stats: RwLock<ResolverStats>,
}

impl SimilarityResolver {
    pub fn new(store: Arc<dyn EntryStore>, config: ResolverConfig) -> Self {
        Self {
            store,
            config,
            capability: OnceCell::new(),
            stats: RwLock::new(ResolverStats::default()),
        }
    }

    /// Probe the store on first use; later calls return the cached result
    pub async fn capability(&self) -> SimilarityCapability {
        *self
            .capability
            .get_or_init(|| async {
                match self.store.probe_similarity().await {
                    Ok(()) => {
                        info!(backend = self.store.backend(), "Trigram similarity available");
                        SimilarityCapability::Trigram
                    }
                    Err(e) => {
                        info!(
                            backend = self.store.backend(),
                            reason = %e,
                            "Trigram similarity unavailable, using substring matching"
                        );
                        SimilarityCapability::SubstringOnly
                    }
                }
            })
            .await
    }

    /// Capability if already probed
    pub fn probed_capability(&self) -> Option<SimilarityCapability> {
        self.capability.get().copied()
    }

    async fn mode_for(&self, exact: bool) -> MatchMode {
        if exact {
            return MatchMode::Exact;
        }
        match self.capability().await {
            SimilarityCapability::Trigram => MatchMode::Similarity {
                threshold: self.config.threshold,
            },
            SimilarityCapability::SubstringOnly => MatchMode::Substring,
        }
    }

    /// Ranked candidates without side effects
    pub async fn lookup(
        &self,
        key: &CanonicalKey,
        exact: bool,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        let start = Instant::now();
        let mode = self.mode_for(exact).await;

        let result = self.store.find_similar(key, mode, limit).await;
        self.record_lookup(start);

        let candidates = result.map_err(|e| {
            warn!(key = %key, error = %e, "Similarity lookup failed");
            e
        })?;

        debug!(key = %key, ?mode, candidates = candidates.len(), "Lookup complete");
        Ok(candidates)
    }

    /// Best single match, with a best-effort popularity increment
    ///
    /// The returned entry reflects the increment when it succeeded. A failed
    /// increment is logged and counted but never fails the call.
    pub async fn resolve_one(&self, key: &CanonicalKey, exact: bool) -> Result<Option<Entry>> {
        let winner = self.lookup(key, exact, 1).await?.into_iter().next();

        let Some(ScoredEntry { mut entry, .. }) = winner else {
            self.update_stats(|s| s.misses += 1);
            return Ok(None);
        };

        self.update_stats(|s| s.hits += 1);

        match self.store.increment_popularity(entry.id).await {
            Ok(()) => entry.popularity += 1,
            Err(e) => {
                self.update_stats(|s| s.increment_failures += 1);
                warn!(key = %key, id = %entry.id, error = %e, "Popularity increment failed");
            }
        }

        Ok(Some(entry))
    }

    fn record_lookup(&self, start: Instant) {
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.update_stats(|stats| {
            stats.lookups += 1;
            let n = stats.lookups as f64;
            stats.avg_lookup_ms = stats.avg_lookup_ms * ((n - 1.0) / n) + duration_ms / n;
        });
    }

    fn update_stats(&self, f: impl FnOnce(&mut ResolverStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    /// Get resolution statistics.
    pub fn get_stats(&self) -> ResolverStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }
}
