//! Generation coordinator
//!
//! Handles confirmed misses with one synthesis per canonical key.
//!
//! ## Request Coalescing
//!
//! The first caller for a key registers a broadcast channel in `in_flight`
//! and spawns the generation task; later callers subscribe to the same
//! channel and wait. Registration and subscription both happen under the
//! DashMap entry lock, so every subscriber is attached before the result is
//! sent.
//!
//! Generation runs in its own task: a caller that goes away stops waiting
//! but does not cancel work other callers depend on. The synthesizer call is
//! bounded by `synth_timeout`, after which the failure fans out to every
//! waiter.
//!
//! ## Exit paths
//!
//! The in-flight slot is owned by a guard that removes it on drop, so the
//! key is released on success, failure, timeout and panic alike. A panicked
//! task drops its sender without sending and waiters see `GenerationFailed`.
//!
//! ## Cross-process writers
//!
//! The in-process lock does not cover other processes. A unique-key conflict
//! on insert means another writer won; the existing entry is re-fetched and
//! returned instead of surfacing the conflict.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::canonical::CanonicalKey;
use crate::store::{Entry, EntryStore, NewEntry, StoreError};
use crate::synth::{ContentSynthesizer, StructuredContent};
use crate::types::{Result, SearchError};

// ============================================================================
// Configuration
// ============================================================================

/// Coordinator configuration
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Hard bound on one synthesizer call
    pub synth_timeout: Duration,
    /// Re-fetch attempts after an insert conflict
    pub conflict_refetch_attempts: u32,
    /// Delay between re-fetch attempts
    pub conflict_refetch_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            synth_timeout: Duration::from_secs(20),
            conflict_refetch_attempts: 3,
            conflict_refetch_backoff: Duration::from_millis(50),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Default)]
struct Counters {
    synthesis_calls: AtomicU64,
    coalesced_waiters: AtomicU64,
    generated: AtomicU64,
    already_present: AtomicU64,
    conflicts: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of coordinator counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    /// Synthesizer invocations
    pub synthesis_calls: u64,
    /// Callers that joined an existing flight
    pub coalesced_waiters: u64,
    /// Entries created
    pub generated: u64,
    /// Flights resolved by the double-check
    pub already_present: u64,
    /// Insert conflicts resolved by re-fetch
    pub conflicts: u64,
    /// Flights that ended in an error
    pub failures: u64,
    /// Keys currently being generated
    pub in_flight: usize,
}

// ============================================================================
// Coordinator
// ============================================================================

type FlightMap = DashMap<CanonicalKey, broadcast::Sender<Result<Entry>>>;

/// Per-key singleflight around synthesis and insert
pub struct GenerationCoordinator {
    store: Arc<dyn EntryStore>,
    synthesizer: Arc<dyn ContentSynthesizer>,
    config: CoordinatorConfig,
    in_flight: Arc<FlightMap>,
    counters: Arc<Counters>,
}

impl GenerationCoordinator {
    pub fn new(
        store: Arc<dyn EntryStore>,
        synthesizer: Arc<dyn ContentSynthesizer>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            synthesizer,
            config,
            in_flight: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Get or create the entry for `key`
    ///
    /// Concurrent calls for the same key share one generation and all observe
    /// the same entry or the same error.
    pub async fn generate(&self, key: &CanonicalKey) -> Result<Entry> {
        self.generate_with(key, || Ok(())).await
    }

    /// Like [`generate`](Self::generate), but `admit` runs only when this
    /// call would start a new flight
    ///
    /// Callers that join an in-flight generation skip `admit`. An error from
    /// `admit` is returned without registering the key.
    pub async fn generate_with<F>(&self, key: &CanonicalKey, admit: F) -> Result<Entry>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut receiver = match self.in_flight.entry(key.clone()) {
            MapEntry::Occupied(flight) => {
                self.counters.coalesced_waiters.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Joining in-flight generation");
                flight.get().subscribe()
            }
            MapEntry::Vacant(slot) => {
                admit()?;
                let (sender, receiver) = broadcast::channel(1);
                slot.insert(sender.clone());
                self.spawn_flight(key.clone(), sender);
                receiver
            }
        };

        match receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(SearchError::GenerationFailed(
                "Generation task ended without a result".to_string(),
            )),
        }
    }

    fn spawn_flight(&self, key: CanonicalKey, sender: broadcast::Sender<Result<Entry>>) {
        let flight = Flight {
            store: Arc::clone(&self.store),
            synthesizer: Arc::clone(&self.synthesizer),
            config: self.config,
            counters: Arc::clone(&self.counters),
        };
        let guard = FlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.clone(),
        };

        tokio::spawn(async move {
            let start = Instant::now();
            let result = flight.run(&key).await;

            match &result {
                Ok(entry) => debug!(
                    key = %key,
                    id = %entry.id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Generation flight complete"
                ),
                Err(e) => {
                    flight.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Generation failed");
                }
            }

            // Release the key before publishing so a late caller starts a
            // fresh flight (and finds the entry on its double-check)
            drop(guard);
            let _ = sender.send(result);
        });
    }

    /// Keys currently being generated
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn get_stats(&self) -> CoordinatorStats {
        let c = &self.counters;
        CoordinatorStats {
            synthesis_calls: c.synthesis_calls.load(Ordering::Relaxed),
            coalesced_waiters: c.coalesced_waiters.load(Ordering::Relaxed),
            generated: c.generated.load(Ordering::Relaxed),
            already_present: c.already_present.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }
}

/// Removes the in-flight slot when dropped
struct FlightGuard {
    in_flight: Arc<FlightMap>,
    key: CanonicalKey,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Everything one generation task needs
struct Flight {
    store: Arc<dyn EntryStore>,
    synthesizer: Arc<dyn ContentSynthesizer>,
    config: CoordinatorConfig,
    counters: Arc<Counters>,
}

impl Flight {
    async fn run(&self, key: &CanonicalKey) -> Result<Entry> {
        // Another caller may have finished while this one was registering
        if let Some(existing) = self.store.get_by_key(key).await? {
            self.counters.already_present.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, id = %existing.id, "Entry appeared before synthesis");
            return Ok(existing);
        }

        let topic = key.topic();
        self.counters.synthesis_calls.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let raw = match tokio::time::timeout(
            self.config.synth_timeout,
            self.synthesizer.synthesize(&topic),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(SearchError::GenerationFailed(format!(
                    "Synthesizer timed out after {}ms",
                    self.config.synth_timeout.as_millis()
                )))
            }
        };

        let content = StructuredContent::validate(&raw)?;

        match self.store.insert(NewEntry::new(key.clone(), content)).await {
            Ok(entry) => {
                self.counters.generated.fetch_add(1, Ordering::Relaxed);
                info!(
                    key = %key,
                    id = %entry.id,
                    synthesizer = self.synthesizer.id(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Generated entry"
                );
                Ok(entry)
            }
            Err(StoreError::Conflict(_)) => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "Insert conflict, another writer won; re-fetching");
                self.refetch_after_conflict(key).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn refetch_after_conflict(&self, key: &CanonicalKey) -> Result<Entry> {
        for attempt in 0..self.config.conflict_refetch_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.conflict_refetch_backoff).await;
            }
            if let Some(existing) = self.store.get_by_key(key).await? {
                return Ok(existing);
            }
        }

        Err(SearchError::StorageFailed(format!(
            "Entry {} conflicted on insert but could not be re-fetched",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;
    use crate::store::test_support::new_entry;
    use crate::store::{MemoryEntryStore, SqliteEntryStore, SqliteOptions};
    use crate::synth::SynthError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Behavior {
        Valid,
        Invalid,
        Fail,
        Panic,
        /// Insert the entry into the store itself, as a second process would
        RaceInsert,
    }

    struct ScriptedSynth {
        calls: AtomicUsize,
        delay: Duration,
        behavior: Behavior,
        store: Arc<dyn EntryStore>,
    }

    fn content_json(topic: &str) -> Value {
        json!({
            "body": format!("All about {}", topic),
            "advisory": "Don't panic",
            "location": "Magrathea",
            "caution": "Mind the whale",
            "trivia": "Forty-two",
            "sponsorNote": "Sirius Cybernetics",
            "reliability": 70,
            "danger": 5
        })
    }

    #[async_trait]
    impl ContentSynthesizer for ScriptedSynth {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn synthesize(&self, topic: &str) -> std::result::Result<Value, SynthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match self.behavior {
                Behavior::Valid => Ok(content_json(topic)),
                Behavior::Invalid => Ok(json!({ "body": "no other fields" })),
                Behavior::Fail => Err(SynthError::RequestFailed("HTTP 500".to_string())),
                Behavior::Panic => panic!("synthesizer exploded"),
                Behavior::RaceInsert => {
                    self.store.insert(new_entry(topic)).await.ok();
                    Ok(content_json(topic))
                }
            }
        }
    }

    fn setup(
        behavior: Behavior,
        delay: Duration,
        config: CoordinatorConfig,
    ) -> (Arc<GenerationCoordinator>, Arc<ScriptedSynth>, Arc<MemoryEntryStore>) {
        let store = Arc::new(MemoryEntryStore::new());
        let synth = Arc::new(ScriptedSynth {
            calls: AtomicUsize::new(0),
            delay,
            behavior,
            store: store.clone(),
        });
        let coordinator = Arc::new(GenerationCoordinator::new(
            store.clone(),
            synth.clone(),
            config,
        ));
        (coordinator, synth, store)
    }

    fn key(s: &str) -> CanonicalKey {
        canonicalize(s).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_synthesize_once() {
        let (coordinator, synth, store) =
            setup(Behavior::Valid, Duration::from_millis(100), CoordinatorConfig::default());

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.generate(&key("improbability drive")).await })
            })
            .collect();

        let ids: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().id)
            .collect();

        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(store.len(), 1);
        assert_eq!(coordinator.in_flight_count(), 0);

        let stats = coordinator.get_stats();
        assert_eq!(stats.generated, 1);
        assert_eq!(stats.coalesced_waiters, 19);
    }

    #[tokio::test]
    async fn test_existing_entry_short_circuits() {
        let (coordinator, synth, store) =
            setup(Behavior::Valid, Duration::ZERO, CoordinatorConfig::default());
        let existing = store.insert(new_entry("towel")).await.unwrap();

        let entry = coordinator.generate(&key("towel")).await.unwrap();
        assert_eq!(entry.id, existing.id);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_releases_key_and_persists_nothing() {
        let config = CoordinatorConfig {
            synth_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (coordinator, synth, store) = setup(Behavior::Valid, Duration::from_secs(5), config);

        let err = coordinator.generate(&key("slow topic")).await.unwrap_err();
        assert!(matches!(err, SearchError::GenerationFailed(_)), "got {:?}", err);
        assert!(store.is_empty());
        assert_eq!(coordinator.in_flight_count(), 0);

        // A later caller starts a fresh flight
        let _ = coordinator.generate(&key("slow topic")).await;
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_fans_out_to_all_waiters() {
        let (coordinator, synth, store) =
            setup(Behavior::Fail, Duration::from_millis(50), CoordinatorConfig::default());

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.generate(&key("vogon poetry")).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            assert!(matches!(result.unwrap(), Err(SearchError::GenerationFailed(_))));
        }
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
        assert_eq!(coordinator.get_stats().failures, 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_persists_nothing() {
        let (coordinator, _synth, store) =
            setup(Behavior::Invalid, Duration::ZERO, CoordinatorConfig::default());

        let err = coordinator.generate(&key("half an entry")).await.unwrap_err();
        assert!(matches!(err, SearchError::GenerationFailed(_)));
        assert!(store.is_empty());
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_panic_releases_key() {
        let (coordinator, _synth, _store) =
            setup(Behavior::Panic, Duration::ZERO, CoordinatorConfig::default());

        let err = coordinator.generate(&key("bad day")).await.unwrap_err();
        assert!(matches!(err, SearchError::GenerationFailed(_)));
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_conflict_returns_winning_entry() {
        let (coordinator, _synth, store) =
            setup(Behavior::RaceInsert, Duration::ZERO, CoordinatorConfig::default());

        let entry = coordinator.generate(&key("babel fish")).await.unwrap();
        let stored = store.get_by_key(&key("babel fish")).await.unwrap().unwrap();

        assert_eq!(entry.id, stored.id);
        assert_eq!(store.len(), 1);
        assert_eq!(coordinator.get_stats().conflicts, 1);
    }

    #[tokio::test]
    async fn test_sqlite_unique_constraint_returns_winning_entry() {
        let store: Arc<dyn EntryStore> =
            Arc::new(SqliteEntryStore::open_in_memory(SqliteOptions::default()).unwrap());
        let synth = Arc::new(ScriptedSynth {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            behavior: Behavior::RaceInsert,
            store: Arc::clone(&store),
        });
        let coordinator =
            GenerationCoordinator::new(Arc::clone(&store), synth, CoordinatorConfig::default());

        let entry = coordinator.generate(&key("babel fish")).await.unwrap();
        let stored = store.get_by_key(&key("babel fish")).await.unwrap().unwrap();

        assert_eq!(entry.id, stored.id);
        assert_eq!(store.list_recent(10).await.unwrap().len(), 1);

        let stats = coordinator.get_stats();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.generated, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admit_runs_once_per_flight() {
        let (coordinator, synth, _store) =
            setup(Behavior::Valid, Duration::from_millis(100), CoordinatorConfig::default());
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let admitted = Arc::clone(&admitted);
                tokio::spawn(async move {
                    coordinator
                        .generate_with(&key("heart of gold"), || {
                            admitted.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_admit_registers_nothing() {
        let (coordinator, synth, store) =
            setup(Behavior::Valid, Duration::ZERO, CoordinatorConfig::default());

        let err = coordinator
            .generate_with(&key("towel"), || {
                Err(SearchError::RateLimited { retry_after_secs: 7 })
            })
            .await
            .unwrap_err();

        assert_eq!(err, SearchError::RateLimited { retry_after_secs: 7 });
        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disconnecting_caller_does_not_abort_generation() {
        let (coordinator, synth, store) =
            setup(Behavior::Valid, Duration::from_millis(150), CoordinatorConfig::default());

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.generate(&key("deep thought")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        first.abort();

        let entry = coordinator.generate(&key("deep thought")).await.unwrap();
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_by_key(&key("deep thought")).await.unwrap().unwrap().id, entry.id);
    }
}
