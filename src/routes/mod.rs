//! HTTP routes for Lexicon

pub mod entries;
pub mod health;

pub use entries::{handle_popular, handle_recent, handle_resolve, handle_similar};
pub use health::{health_check, stats};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::types::SearchError;

/// JSON response with the given status
pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(value)
        .unwrap_or_else(|_| r#"{"error":"storage_failed","message":"Serialization failed"}"#.to_string());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Error body `{"error": <kind>, "message": <public message>}`, plus
/// `Retry-After` when rate limited
pub(crate) fn error_response(error: &SearchError) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": error.kind(),
        "message": error.public_message(),
    });

    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*");

    if let Some(secs) = error.retry_after() {
        builder = builder.header("Retry-After", secs.to_string());
    }

    builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
}

/// Bad request response for malformed query strings
pub(crate) fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    error_response(&SearchError::InvalidInput(message.to_string()))
}
