//! Usage logging
//!
//! One JSONL line per public operation, for offline analysis of what people
//! look up and what gets rejected. Writing is best-effort: failures are
//! logged and never reach the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::canonical::CanonicalKey;
use crate::types::{ErrorKind, SearchError};

/// Usage event types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Resolved to an existing entry
    Hit,
    /// Miss that produced a new entry
    Generated,
    /// Exact lookup with no match
    NotFound,
    /// Rejected by the input guard
    Blocked,
    /// Rejected by the rate limiter
    RateLimited,
    /// Generation or storage failure
    Failed,
    /// Suggestion lookup
    Suggest,
    /// Recent or popular listing
    Listed,
}

impl EventType {
    /// Event type recorded for a failed operation
    pub fn for_error(error: &SearchError) -> Self {
        match error.kind() {
            ErrorKind::Blocked => EventType::Blocked,
            ErrorKind::RateLimited => EventType::RateLimited,
            ErrorKind::NotFound => EventType::NotFound,
            _ => EventType::Failed,
        }
    }
}

/// Usage event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub event_type: EventType,
    /// Rate-limit subject (client address)
    pub subject: Option<String>,
    /// Canonical key, when the query got that far
    pub canonical_key: Option<CanonicalKey>,
    /// Entry returned, if any
    pub entry_id: Option<Uuid>,
    /// Number of results for listings and suggestions
    pub results: Option<usize>,
    /// Duration in milliseconds
    pub duration_ms: Option<u64>,
    /// Error kind for failed operations
    pub error_kind: Option<ErrorKind>,
}

impl UsageEvent {
    /// Create a new usage event
    pub fn new(event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            subject: None,
            canonical_key: None,
            entry_id: None,
            results: None,
            duration_ms: None,
            error_kind: None,
        }
    }

    /// Event describing a failed operation
    pub fn from_error(error: &SearchError) -> Self {
        let mut event = Self::new(EventType::for_error(error));
        event.error_kind = Some(error.kind());
        event
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_key(mut self, key: &CanonicalKey) -> Self {
        self.canonical_key = Some(key.clone());
        self
    }

    pub fn with_entry(mut self, id: Uuid) -> Self {
        self.entry_id = Some(id);
        self
    }

    pub fn with_results(mut self, results: usize) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Usage logger that writes events to a JSONL file
#[derive(Clone)]
pub struct UsageLogger {
    inner: Arc<Mutex<UsageLoggerInner>>,
}

struct UsageLoggerInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl UsageLogger {
    /// Logger with no destination; events are dropped until `init_file`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(UsageLoggerInner {
                writer: None,
                path: None,
            })),
        }
    }

    /// Initialize file logging to the specified path
    pub async fn init_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut inner = self.inner.lock().await;
        inner.writer = Some(BufWriter::new(file));
        inner.path = Some(path.clone());

        info!("Usage logging initialized to {}", path.display());
        Ok(())
    }

    /// Log a usage event
    pub async fn log(&self, event: UsageEvent) {
        let jsonl = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize usage event: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock().await;

        if let Some(ref mut writer) = inner.writer {
            if let Err(e) = writeln!(writer, "{}", jsonl) {
                error!("Failed to write usage event: {}", e);
            }
            if let Err(e) = writer.flush() {
                error!("Failed to flush usage log: {}", e);
            }
        }
    }

    /// Current destination, if file logging is enabled
    pub async fn path(&self) -> Option<PathBuf> {
        self.inner.lock().await.path.clone()
    }
}

impl Default for UsageLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;

    #[test]
    fn test_event_serialization() {
        let event = UsageEvent::new(EventType::Generated)
            .with_subject("10.0.0.7")
            .with_key(&canonicalize("Babel Fish").unwrap())
            .with_duration(1200);

        let jsonl = event.to_jsonl().unwrap();
        assert!(jsonl.contains("\"generated\""));
        assert!(jsonl.contains("babel-fish"));
        assert!(jsonl.contains("10.0.0.7"));
    }

    #[test]
    fn test_error_events() {
        let event = UsageEvent::from_error(&SearchError::RateLimited { retry_after_secs: 3 });
        assert_eq!(event.event_type, EventType::RateLimited);
        assert_eq!(event.error_kind, Some(ErrorKind::RateLimited));

        let event = UsageEvent::from_error(&SearchError::StorageFailed("disk".to_string()));
        assert_eq!(event.event_type, EventType::Failed);
        assert!(event.to_jsonl().unwrap().contains("storage_failed"));
    }

    #[tokio::test]
    async fn test_writes_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");

        let logger = UsageLogger::new();
        logger.init_file(path.clone()).await.unwrap();
        logger.log(UsageEvent::new(EventType::Hit)).await;
        logger.log(UsageEvent::new(EventType::Listed).with_results(3)).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: UsageEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.event_type, EventType::Listed);
        assert_eq!(second.results, Some(3));
    }

    #[tokio::test]
    async fn test_logger_without_file_drops_events() {
        let logger = UsageLogger::default();
        logger.log(UsageEvent::new(EventType::Hit)).await;
        assert!(logger.path().await.is_none());
    }
}
