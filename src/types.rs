//! Shared error and result types
//!
//! Every failure a caller can observe is a [`SearchError`]. Each variant has a
//! stable machine-readable [`ErrorKind`] and a message that is safe to show to
//! end users. Rule matches, SQL errors and synthesizer output are logged where
//! they happen and never carried into the public message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SearchError>;

/// Stable, machine-readable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Blocked,
    RateLimited,
    NotFound,
    GenerationFailed,
    StorageFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Blocked => "blocked",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::GenerationFailed => "generation_failed",
            ErrorKind::StorageFailed => "storage_failed",
        }
    }
}

/// Error returned by the term resolution service
///
/// `Clone` so that one generation failure can be delivered to every caller
/// waiting on the same key.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SearchError {
    /// Query is empty after normalization or exceeds the length cap
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Query was rejected by the input guard
    #[error("Query not allowed")]
    Blocked,

    /// Too many calls for this subject within the window
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Exact lookup found nothing (generation is never attempted)
    #[error("No entry for '{0}'")]
    NotFound(String),

    /// Synthesizer error, timeout or schema mismatch
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// Storage backend failure
    #[error("Storage failed: {0}")]
    StorageFailed(String),
}

impl SearchError {
    /// Stable error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            SearchError::InvalidInput(_) => ErrorKind::InvalidInput,
            SearchError::Blocked => ErrorKind::Blocked,
            SearchError::RateLimited { .. } => ErrorKind::RateLimited,
            SearchError::NotFound(_) => ErrorKind::NotFound,
            SearchError::GenerationFailed(_) => ErrorKind::GenerationFailed,
            SearchError::StorageFailed(_) => ErrorKind::StorageFailed,
        }
    }

    /// Message safe to return to callers
    pub fn public_message(&self) -> String {
        match self {
            // Input validation messages are produced by this crate and never
            // contain backend detail.
            SearchError::InvalidInput(msg) => msg.clone(),
            SearchError::Blocked => "This query cannot be processed".to_string(),
            SearchError::RateLimited { retry_after_secs } => {
                format!("Too many requests, retry after {}s", retry_after_secs)
            }
            SearchError::NotFound(key) => format!("No entry found for '{}'", key),
            SearchError::GenerationFailed(_) => {
                "The entry could not be generated right now, please try again later".to_string()
            }
            SearchError::StorageFailed(_) => {
                "The entry store is temporarily unavailable".to_string()
            }
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            SearchError::InvalidInput(_) => 400,
            SearchError::Blocked => 403,
            SearchError::RateLimited { .. } => 429,
            SearchError::NotFound(_) => 404,
            SearchError::GenerationFailed(_) => 502,
            SearchError::StorageFailed(_) => 503,
        }
    }

    /// Retry hint in seconds, if any
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            SearchError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(SearchError::Blocked.kind().as_str(), "blocked");
        assert_eq!(
            SearchError::RateLimited { retry_after_secs: 3 }.kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::GenerationFailed).unwrap(),
            "\"generation_failed\""
        );
    }

    #[test]
    fn test_public_message_hides_detail() {
        let err = SearchError::StorageFailed("UNIQUE constraint failed: entries.canonical_key".into());
        assert!(!err.public_message().contains("UNIQUE"));

        let err = SearchError::GenerationFailed("upstream returned HTTP 500: stack...".into());
        assert!(!err.public_message().contains("500"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(SearchError::InvalidInput("x".into()).status_code(), 400);
        assert_eq!(SearchError::Blocked.status_code(), 403);
        assert_eq!(SearchError::NotFound("x".into()).status_code(), 404);
        assert_eq!(SearchError::RateLimited { retry_after_secs: 1 }.status_code(), 429);
        assert_eq!(
            SearchError::RateLimited { retry_after_secs: 7 }.retry_after(),
            Some(7)
        );
    }
}
