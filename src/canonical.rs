//! Canonical keys
//!
//! Raw queries are reduced to a lowercase slug: whitespace and hyphen runs
//! become a single `-`, anything outside `[a-z0-9-]` is dropped and the result
//! is trimmed of separators. The transformation is deterministic and
//! idempotent, so equal keys always address the same entry.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Result, SearchError};

/// Hard cap on raw query length, in characters
pub const MAX_QUERY_CHARS: usize = 200;

/// Normalized key identifying a topic for lookup and storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Normalize a raw query into a key
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.chars().count() > MAX_QUERY_CHARS {
            return Err(SearchError::InvalidInput(format!(
                "Query exceeds {} characters",
                MAX_QUERY_CHARS
            )));
        }

        let mut key = String::with_capacity(raw.len());
        let mut pending_separator = false;

        for c in raw.chars().flat_map(char::to_lowercase) {
            if c.is_whitespace() || c == '-' {
                pending_separator = true;
            } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
                if pending_separator && !key.is_empty() {
                    key.push('-');
                }
                pending_separator = false;
                key.push(c);
            }
            // Everything else is stripped without breaking a separator run
        }

        if key.is_empty() {
            return Err(SearchError::InvalidInput(
                "Query has no searchable characters".to_string(),
            ));
        }

        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in characters (always ASCII)
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Separator-free form used for variant matching ("gargle-blaster" -> "gargleblaster")
    pub fn compact(&self) -> String {
        self.0.replace('-', "")
    }

    /// Human-readable topic handed to the synthesizer ("babel-fish" -> "babel fish")
    pub fn topic(&self) -> String {
        self.0.replace('-', " ")
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a raw query into a canonical key
pub fn canonicalize(raw: &str) -> Result<CanonicalKey> {
    CanonicalKey::parse(raw)
}
