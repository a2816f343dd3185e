//! Entry endpoints
//!
//! - `GET /api/v1/entries/resolve?q=&exact=` - resolve or generate
//! - `GET /api/v1/entries/similar?q=&limit=` - suggestions (read-only)
//! - `GET /api/v1/entries/recent?limit=`
//! - `GET /api/v1/entries/popular?limit=`

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{bad_request_response, error_response, json_response};
use crate::server::AppState;
use crate::store::{Entry, ScoredEntry};

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub q: String,
    #[serde(default)]
    pub exact: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
struct EntryList<'a, T> {
    entries: &'a [T],
    count: usize,
}

fn parse_query<'a, T: Deserialize<'a>>(query: Option<&'a str>) -> Result<T, Response<Full<Bytes>>> {
    serde_urlencoded::from_str(query.unwrap_or(""))
        .map_err(|e| bad_request_response(&format!("Invalid query string: {}", e)))
}

/// `GET /api/v1/entries/resolve`
pub async fn handle_resolve(
    state: Arc<AppState>,
    subject: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let params: ResolveQuery = match parse_query(query) {
        Ok(p) => p,
        Err(response) => return response,
    };

    match state
        .service
        .resolve_or_generate(subject, &params.q, params.exact)
        .await
    {
        Ok(entry) => json_response(StatusCode::OK, &entry),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/entries/similar`
pub async fn handle_similar(
    state: Arc<AppState>,
    subject: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let params: SimilarQuery = match parse_query(query) {
        Ok(p) => p,
        Err(response) => return response,
    };

    match state.service.list_similar(subject, &params.q, params.limit).await {
        Ok(found) => list_response::<ScoredEntry>(&found),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/entries/recent`
pub async fn handle_recent(state: Arc<AppState>, query: Option<&str>) -> Response<Full<Bytes>> {
    let params: ListQuery = match parse_query(query) {
        Ok(p) => p,
        Err(response) => return response,
    };

    match state.service.list_recent(params.limit).await {
        Ok(entries) => list_response::<Entry>(&entries),
        Err(e) => error_response(&e),
    }
}

/// `GET /api/v1/entries/popular`
pub async fn handle_popular(state: Arc<AppState>, query: Option<&str>) -> Response<Full<Bytes>> {
    let params: ListQuery = match parse_query(query) {
        Ok(p) => p,
        Err(response) => return response,
    };

    match state.service.list_popular(params.limit).await {
        Ok(entries) => list_response::<Entry>(&entries),
        Err(e) => error_response(&e),
    }
}

fn list_response<T: Serialize>(items: &[T]) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &EntryList {
            entries: items,
            count: items.len(),
        },
    )
}
