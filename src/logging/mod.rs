//! Logging infrastructure
//!
//! Diagnostic logging goes through `tracing`; this module adds the optional
//! per-request usage log.

pub mod usage;

pub use usage::{EventType, UsageEvent, UsageLogger};
