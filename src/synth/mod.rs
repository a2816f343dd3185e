//! Content synthesis
//!
//! The synthesizer is an external collaborator: given a human-readable topic
//! it returns a JSON document that must be schema-validated before anything
//! is persisted. Backends implement [`ContentSynthesizer`];
//! [`StructuredContent::validate`] is the only path from raw output to
//! storable content.

pub mod http;

pub use http::HttpSynthesizer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::CanonicalKey;
use crate::types::SearchError;

/// Upper bound on stored cross references per entry
pub const MAX_CROSS_REFERENCES: usize = 10;

/// Errors from a synthesizer backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthError {
    /// Backend is not configured or not reachable
    #[error("Synthesizer unavailable: {0}")]
    Unavailable(String),

    /// Request failed
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Rate limited by the backend
    #[error("Rate limited by synthesizer")]
    RateLimited,

    /// Response body was not JSON
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<SynthError> for SearchError {
    fn from(e: SynthError) -> Self {
        SearchError::GenerationFailed(e.to_string())
    }
}

/// Synthesizer output that does not match the required shape
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("Expected a JSON object")]
    NotAnObject,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Field {0} must not be empty")]
    Empty(&'static str),

    #[error("Field {field} out of range 0-100: {value}")]
    OutOfRange { field: &'static str, value: u64 },
}

impl From<SchemaError> for SearchError {
    fn from(e: SchemaError) -> Self {
        SearchError::GenerationFailed(format!("Schema mismatch: {}", e))
    }
}

/// Produces raw structured content for a topic
#[async_trait]
pub trait ContentSynthesizer: Send + Sync {
    /// Backend identifier
    fn id(&self) -> &str;

    /// Generate content for a topic. The result is unvalidated.
    async fn synthesize(&self, topic: &str) -> Result<Value, SynthError>;
}

/// Stand-in when no synthesizer URL is configured; every miss fails with
/// `Unavailable`
pub struct UnconfiguredSynthesizer;

#[async_trait]
impl ContentSynthesizer for UnconfiguredSynthesizer {
    fn id(&self) -> &str {
        "unconfigured"
    }

    async fn synthesize(&self, _topic: &str) -> Result<Value, SynthError> {
        Err(SynthError::Unavailable("no synthesizer configured".to_string()))
    }
}

/// Validated synthesizer output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredContent {
    pub body: String,
    pub advisory: String,
    pub location: String,
    pub caution: String,
    pub trivia: String,
    pub sponsor_note: String,
    pub reliability: u8,
    pub danger: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_references: Vec<CanonicalKey>,
}

impl StructuredContent {
    /// Check raw output against the required schema
    ///
    /// All six text fields must be strings and `body` must be non-blank.
    /// `reliability` and `danger` must be integers in 0-100. `category` and
    /// `crossReferences` are optional; cross references that do not
    /// canonicalize are dropped rather than failing the entry.
    pub fn validate(value: &Value) -> Result<Self, SchemaError> {
        let obj = value.as_object().ok_or(SchemaError::NotAnObject)?;

        let text = |field: &'static str| -> Result<String, SchemaError> {
            match obj.get(field) {
                None | Some(Value::Null) => Err(SchemaError::MissingField(field)),
                Some(Value::String(s)) => Ok(s.trim().to_string()),
                Some(_) => Err(SchemaError::WrongType {
                    field,
                    expected: "a string",
                }),
            }
        };

        let score = |field: &'static str| -> Result<u8, SchemaError> {
            let raw = obj.get(field).ok_or(SchemaError::MissingField(field))?;
            let value = raw.as_u64().ok_or(SchemaError::WrongType {
                field,
                expected: "a non-negative integer",
            })?;
            u8::try_from(value)
                .ok()
                .filter(|v| *v <= 100)
                .ok_or(SchemaError::OutOfRange { field, value })
        };

        let body = text("body")?;
        if body.is_empty() {
            return Err(SchemaError::Empty("body"));
        }

        let category = match obj.get("category") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        };

        let mut cross_references: Vec<CanonicalKey> = Vec::new();
        if let Some(Value::Array(items)) = obj.get("crossReferences") {
            for key in items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| CanonicalKey::parse(s).ok())
            {
                if !cross_references.contains(&key) {
                    cross_references.push(key);
                }
            }
            cross_references.truncate(MAX_CROSS_REFERENCES);
        }

        Ok(Self {
            body,
            advisory: text("advisory")?,
            location: text("location")?,
            caution: text("caution")?,
            trivia: text("trivia")?,
            sponsor_note: text("sponsorNote")?,
            reliability: score("reliability")?,
            danger: score("danger")?,
            category,
            cross_references,
        })
    }
}
