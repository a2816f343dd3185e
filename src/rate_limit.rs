//! Per-subject sliding-window rate limiting
//!
//! One window per `(operation class, subject)` pair, created lazily. Each
//! window keeps the timestamps of accepted calls; a call is admitted when
//! fewer than `max` of them fall inside the trailing window. The DashMap
//! entry lock makes check-and-record atomic for concurrent calls on the same
//! subject.
//!
//! Rejected calls are not recorded, so a client hammering the endpoint while
//! throttled does not extend its own lockout.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::{Result, SearchError};

/// Class of operation being throttled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Lookup via resolve-or-generate
    Search,
    /// Synthesis of a new entry on a miss
    Generate,
    /// Non-mutating suggestion lookups
    Suggest,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationClass::Search => f.write_str("search"),
            OperationClass::Generate => f.write_str("generate"),
            OperationClass::Suggest => f.write_str("suggest"),
        }
    }
}

/// `max` calls per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max: u32, window_seconds: u64) -> Self {
        Self {
            max,
            window: Duration::from_secs(window_seconds),
        }
    }
}

impl FromStr for RateLimit {
    type Err = String;

    /// Parse `"<max>/<window_seconds>"`, e.g. `"5/60"`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (max, window) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <max>/<window_seconds>, got '{}'", s))?;
        let max: u32 = max
            .trim()
            .parse()
            .map_err(|e| format!("invalid max in '{}': {}", s, e))?;
        let window: u64 = window
            .trim()
            .parse()
            .map_err(|e| format!("invalid window in '{}': {}", s, e))?;
        if max == 0 || window == 0 {
            return Err(format!("max and window must be positive, got '{}'", s));
        }
        Ok(Self::new(max, window))
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.max, self.window.as_secs())
    }
}

/// Limits for each operation class
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub search: RateLimit,
    pub generate: RateLimit,
    pub suggest: RateLimit,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            search: RateLimit::new(60, 60),
            generate: RateLimit::new(5, 60),
            suggest: RateLimit::new(120, 60),
        }
    }
}

impl RateLimits {
    pub fn for_class(&self, class: OperationClass) -> RateLimit {
        match class {
            OperationClass::Search => self.search,
            OperationClass::Generate => self.generate,
            OperationClass::Suggest => self.suggest,
        }
    }
}

/// Sliding-window rate limiter keyed by operation class and subject
pub struct RateLimiter {
    windows: DashMap<(OperationClass, String), Vec<Instant>>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            windows: DashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Admit and record a call under the configured limit for `class`
    pub fn check(&self, class: OperationClass, subject: &str) -> Result<()> {
        self.check_with(class, subject, self.limits.for_class(class))
    }

    /// Admit and record a call under an explicit limit
    pub fn check_with(&self, class: OperationClass, subject: &str, limit: RateLimit) -> Result<()> {
        let now = Instant::now();

        let mut calls = self.windows.entry((class, subject.to_string())).or_default();
        calls.retain(|&at| now.duration_since(at) < limit.window);

        if calls.len() >= limit.max as usize {
            // Oldest call in the window decides when a slot frees up
            let oldest = calls.iter().min().copied().unwrap_or(now);
            let wait = limit.window.saturating_sub(now.duration_since(oldest));
            let retry_after_secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);

            debug!(class = %class, subject = subject, "Rate limit exceeded");
            return Err(SearchError::RateLimited {
                retry_after_secs: retry_after_secs.max(1),
            });
        }

        calls.push(now);
        Ok(())
    }

    /// Calls currently counted against a subject
    pub fn current_count(&self, class: OperationClass, subject: &str) -> usize {
        let window = self.limits.for_class(class).window;
        let now = Instant::now();
        self.windows
            .get(&(class, subject.to_string()))
            .map(|calls| calls.iter().filter(|&&at| now.duration_since(at) < window).count())
            .unwrap_or(0)
    }

    /// Number of tracked windows
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop expired timestamps and empty windows
    pub fn cleanup(&self) {
        let now = Instant::now();
        let limits = self.limits;

        self.windows.retain(|(class, _), calls| {
            let window = limits.for_class(*class).window;
            calls.retain(|&at| now.duration_since(at) < window);
            !calls.is_empty()
        });
    }
}

/// Periodically prune expired windows
pub fn spawn_cleanup_task(limiter: Arc<RateLimiter>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            limiter.cleanup();
            debug!(windows = limiter.window_count(), "Rate limit windows pruned");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixth_call_is_limited() {
        let limiter = RateLimiter::new(RateLimits::default());
        let limit = RateLimit::new(5, 60);

        for _ in 0..5 {
            assert!(limiter.check_with(OperationClass::Search, "10.0.0.1", limit).is_ok());
        }

        let err = limiter
            .check_with(OperationClass::Search, "10.0.0.1", limit)
            .unwrap_err();
        match err {
            SearchError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_rejected_calls_do_not_consume_budget() {
        let limiter = RateLimiter::new(RateLimits::default());
        let limit = RateLimit::new(2, 60);

        limiter.check_with(OperationClass::Search, "s", limit).unwrap();
        limiter.check_with(OperationClass::Search, "s", limit).unwrap();
        for _ in 0..10 {
            assert!(limiter.check_with(OperationClass::Search, "s", limit).is_err());
        }
        assert_eq!(limiter.current_count(OperationClass::Search, "s"), 2);
    }

    #[test]
    fn test_subjects_and_classes_are_independent() {
        let limiter = RateLimiter::new(RateLimits::default());
        let limit = RateLimit::new(1, 60);

        limiter.check_with(OperationClass::Search, "a", limit).unwrap();
        assert!(limiter.check_with(OperationClass::Search, "a", limit).is_err());
        assert!(limiter.check_with(OperationClass::Search, "b", limit).is_ok());
        assert!(limiter.check_with(OperationClass::Generate, "a", limit).is_ok());
    }

    #[tokio::test]
    async fn test_window_elapses() {
        let limiter = RateLimiter::new(RateLimits::default());
        let limit = RateLimit {
            max: 5,
            window: Duration::from_millis(50),
        };

        for _ in 0..5 {
            limiter.check_with(OperationClass::Search, "s", limit).unwrap();
        }
        assert!(limiter.check_with(OperationClass::Search, "s", limit).is_err());

        tokio::time::sleep(Duration::from_millis(70)).await;

        for _ in 0..5 {
            assert!(limiter.check_with(OperationClass::Search, "s", limit).is_ok());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_respect_max() {
        let limiter = Arc::new(RateLimiter::new(RateLimits::default()));
        let limit = RateLimit::new(10, 60);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.check_with(OperationClass::Generate, "hot", limit).is_ok()
                })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_cleanup_drops_expired_windows() {
        let limits = RateLimits {
            search: RateLimit {
                max: 5,
                window: Duration::from_millis(10),
            },
            ..Default::default()
        };
        let limiter = RateLimiter::new(limits);
        limiter.check(OperationClass::Search, "s").unwrap();
        assert_eq!(limiter.window_count(), 1);

        std::thread::sleep(Duration::from_millis(20));
        limiter.cleanup();
        assert_eq!(limiter.window_count(), 0);
    }

    #[test]
    fn test_parse_rate_limit() {
        let limit: RateLimit = "5/60".parse().unwrap();
        assert_eq!(limit, RateLimit::new(5, 60));
        assert!("5".parse::<RateLimit>().is_err());
        assert!("0/60".parse::<RateLimit>().is_err());
        assert!("x/60".parse::<RateLimit>().is_err());
    }
}
