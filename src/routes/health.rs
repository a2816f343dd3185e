//! Health and stats endpoints
//!
//! - `/health`, `/healthz` - liveness, plus store mode and matching tier
//! - `/api/v1/stats` - resolver and coordinator counters

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use super::json_response;
use crate::resolver::SimilarityCapability;
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall health status (true if service is running)
    pub healthy: bool,
    /// Service version
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    /// Store backend ("sqlite" or "memory")
    pub store: &'static str,
    /// Whether entries survive a restart
    pub persistent: bool,
    /// Matching tier in use
    pub similarity: SimilarityCapability,
    /// Whether a synthesizer is configured
    pub synthesizer_configured: bool,
    /// Current timestamp
    pub timestamp: String,
}

/// Handle liveness probe (/health, /healthz)
pub async fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let response = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        store: state.service.store_backend(),
        persistent: state.args.database_path.is_some(),
        similarity: state.service.similarity_capability().await,
        synthesizer_configured: state.args.synthesizer_url.is_some(),
        timestamp: Utc::now().to_rfc3339(),
    };

    json_response(StatusCode::OK, &response)
}

/// Handle `/api/v1/stats`
pub fn stats(state: Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &state.service.stats())
}
