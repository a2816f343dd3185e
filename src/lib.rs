//! Lexicon - term resolution and generated entry cache
//!
//! "Seek and ye shall find" - Matthew 7:7
//!
//! Lexicon turns free-text queries into canonical keys, finds the closest
//! stored entry, and generates a new one through a content synthesizer when
//! nothing matches. Concurrent misses for the same key share one synthesis.
//!
//! ## Components
//!
//! - **Canonical**: query normalization into [`CanonicalKey`]
//! - **Guard**: rejects injection, probing and keyboard-noise queries
//! - **Rate limit**: per-subject sliding windows per operation class
//! - **Resolver**: exact, substring and trigram similarity lookup
//! - **Coordinator**: single-flight generation per key
//! - **Store**: SQLite or in-memory entry persistence

pub mod canonical;
pub mod config;
pub mod coordinator;
pub mod guard;
pub mod logging;
pub mod rate_limit;
pub mod resolver;
pub mod routes;
pub mod server;
pub mod service;
pub mod store;
pub mod synth;
pub mod trigram;
pub mod types;

pub use canonical::{canonicalize, CanonicalKey};
pub use config::Args;
pub use server::{run, AppState};
pub use service::{LexiconService, ServiceConfig};
pub use types::{ErrorKind, Result, SearchError};
