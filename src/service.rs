//! Lexicon service - the public entry point
//!
//! ```text
//! raw query ─► canonicalize ─► guard ─► rate limit ─► resolver ─┬─ hit: +1 popularity
//!                                                               └─ miss: coordinator ─► synthesizer ─► store
//! ```
//!
//! Invalid, blocked and rate-limited queries stop before touching the store.
//! Exact lookups never generate. Suggestions never generate and never count
//! towards popularity.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::canonical::{canonicalize, CanonicalKey};
use crate::coordinator::{CoordinatorConfig, CoordinatorStats, GenerationCoordinator};
use crate::guard::{InputGuard, Verdict};
use crate::logging::{EventType, UsageEvent, UsageLogger};
use crate::rate_limit::{OperationClass, RateLimiter, RateLimits};
use crate::resolver::{ResolverConfig, ResolverStats, SimilarityCapability, SimilarityResolver};
use crate::store::{Entry, EntryStore, ScoredEntry};
use crate::synth::ContentSynthesizer;
use crate::types::{Result, SearchError};

/// Service configuration
#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    pub resolver: ResolverConfig,
    pub coordinator: CoordinatorConfig,
    pub rate_limits: RateLimits,
    /// Listing size when the caller gives none
    pub default_limit: usize,
    /// Upper bound on any listing size
    pub max_limit: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            coordinator: CoordinatorConfig::default(),
            rate_limits: RateLimits::default(),
            default_limit: 10,
            max_limit: 50,
        }
    }
}

/// Combined counters for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub store: &'static str,
    pub similarity: Option<SimilarityCapability>,
    pub resolver: ResolverStats,
    pub coordinator: CoordinatorStats,
    pub rate_limit_windows: usize,
}

/// Term resolution and entry cache
pub struct LexiconService {
    store: Arc<dyn EntryStore>,
    guard: InputGuard,
    limiter: Arc<RateLimiter>,
    resolver: SimilarityResolver,
    coordinator: GenerationCoordinator,
    config: ServiceConfig,
    usage: Option<UsageLogger>,
}

impl LexiconService {
    pub fn new(
        store: Arc<dyn EntryStore>,
        synthesizer: Arc<dyn ContentSynthesizer>,
        guard: InputGuard,
        config: ServiceConfig,
    ) -> Self {
        Self {
            resolver: SimilarityResolver::new(Arc::clone(&store), config.resolver),
            coordinator: GenerationCoordinator::new(
                Arc::clone(&store),
                synthesizer,
                config.coordinator,
            ),
            limiter: Arc::new(RateLimiter::new(config.rate_limits)),
            store,
            guard,
            config,
            usage: None,
        }
    }

    /// Record one usage event per public operation
    pub fn with_usage_logger(mut self, logger: UsageLogger) -> Self {
        self.usage = Some(logger);
        self
    }

    /// Shared limiter, for the periodic cleanup task
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Probe (once) and report the store's matching tier
    pub async fn similarity_capability(&self) -> SimilarityCapability {
        self.resolver.capability().await
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    // ========================================================================
    // Resolve
    // ========================================================================

    /// Find the entry for a raw query, generating it on a miss
    ///
    /// `subject` identifies the caller for rate limiting. With `exact`, only
    /// exact or separator-insensitive matches count and a miss is `NotFound`.
    pub async fn resolve_or_generate(
        &self,
        subject: &str,
        raw: &str,
        exact: bool,
    ) -> Result<Entry> {
        let start = Instant::now();
        let mut key = None;

        let result = self.resolve_inner(subject, raw, exact, &mut key).await;

        let event = match &result {
            Ok((entry, event_type)) => UsageEvent::new(*event_type).with_entry(entry.id),
            Err(e) => UsageEvent::from_error(e),
        };
        self.record(event, subject, key.as_ref(), start).await;

        result.map(|(entry, _)| entry)
    }

    async fn resolve_inner(
        &self,
        subject: &str,
        raw: &str,
        exact: bool,
        key_out: &mut Option<CanonicalKey>,
    ) -> Result<(Entry, EventType)> {
        let key = self.admit(subject, raw, OperationClass::Search)?;
        *key_out = Some(key.clone());

        if let Some(entry) = self.resolver.resolve_one(&key, exact).await? {
            debug!(key = %key, matched = %entry.canonical_key, "Resolved to existing entry");
            return Ok((entry, EventType::Hit));
        }

        if exact {
            return Err(SearchError::NotFound(key.to_string()));
        }

        // Only the caller that starts a flight spends generation budget
        let entry = self
            .coordinator
            .generate_with(&key, || self.limiter.check(OperationClass::Generate, subject))
            .await?;
        Ok((entry, EventType::Generated))
    }

    /// Canonicalize, guard and rate limit; nothing past here runs for
    /// rejected queries
    fn admit(&self, subject: &str, raw: &str, class: OperationClass) -> Result<CanonicalKey> {
        let key = canonicalize(raw)?;

        if let Verdict::Reject(reason) = self.guard.check(raw, &key) {
            debug!(subject = subject, code = %reason.code(), "Query rejected by guard");
            return Err(SearchError::Blocked);
        }

        self.limiter.check(class, subject)?;
        Ok(key)
    }

    // ========================================================================
    // Read-only
    // ========================================================================

    /// Ranked suggestions; never generates and never counts popularity
    pub async fn list_similar(
        &self,
        subject: &str,
        raw: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredEntry>> {
        let start = Instant::now();
        let limit = self.clamp_limit(limit);
        let mut key = None;

        let result = async {
            let k = self.admit(subject, raw, OperationClass::Suggest)?;
            key = Some(k.clone());
            self.resolver.lookup(&k, false, limit).await
        }
        .await;

        let event = match &result {
            Ok(found) => UsageEvent::new(EventType::Suggest).with_results(found.len()),
            Err(e) => UsageEvent::from_error(e),
        };
        self.record(event, subject, key.as_ref(), start).await;

        result
    }

    /// Most recently created entries
    pub async fn list_recent(&self, limit: Option<usize>) -> Result<Vec<Entry>> {
        let start = Instant::now();
        let entries = self.store.list_recent(self.clamp_limit(limit)).await?;
        self.record_listing(entries.len(), start).await;
        Ok(entries)
    }

    /// Most popular entries
    pub async fn list_popular(&self, limit: Option<usize>) -> Result<Vec<Entry>> {
        let start = Instant::now();
        let entries = self.store.list_popular(self.clamp_limit(limit)).await?;
        self.record_listing(entries.len(), start).await;
        Ok(entries)
    }

    fn clamp_limit(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            store: self.store.backend(),
            similarity: self.resolver.probed_capability(),
            resolver: self.resolver.get_stats(),
            coordinator: self.coordinator.get_stats(),
            rate_limit_windows: self.limiter.window_count(),
        }
    }

    // ========================================================================
    // Usage
    // ========================================================================

    async fn record(
        &self,
        event: UsageEvent,
        subject: &str,
        key: Option<&CanonicalKey>,
        start: Instant,
    ) {
        let Some(usage) = &self.usage else {
            return;
        };

        let mut event = event
            .with_subject(subject)
            .with_duration(start.elapsed().as_millis() as u64);
        if let Some(key) = key {
            event = event.with_key(key);
        }
        usage.log(event).await;
    }

    async fn record_listing(&self, results: usize, start: Instant) {
        if let Some(usage) = &self.usage {
            let event = UsageEvent::new(EventType::Listed)
                .with_results(results)
                .with_duration(start.elapsed().as_millis() as u64);
            usage.log(event).await;
        }
    }
}
