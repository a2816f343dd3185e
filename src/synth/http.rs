//! HTTP synthesizer client
//!
//! Posts `{"topic": ...}` to `<base_url>/synthesize` and hands the JSON body
//! back unvalidated.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{ContentSynthesizer, SynthError};

/// Synthesizer reached over HTTP
pub struct HttpSynthesizer {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    topic: &'a str,
}

impl HttpSynthesizer {
    /// `request_timeout` bounds a single HTTP exchange; the coordinator
    /// applies its own overall timeout on top.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, SynthError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| SynthError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn synthesize_url(&self) -> String {
        format!("{}/synthesize", self.base_url)
    }

    fn auth_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {}", t))
    }
}

#[async_trait]
impl ContentSynthesizer for HttpSynthesizer {
    fn id(&self) -> &str {
        &self.base_url
    }

    async fn synthesize(&self, topic: &str) -> Result<Value, SynthError> {
        let mut request = self.client.post(self.synthesize_url());

        if let Some(auth) = self.auth_header() {
            request = request.header(header::AUTHORIZATION, auth);
        }

        let response = request
            .json(&SynthesizeRequest { topic })
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    SynthError::Unavailable(e.to_string())
                } else {
                    SynthError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SynthError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthError::RequestFailed(format!("HTTP {}: {}", status, body)));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| SynthError::Parse(e.to_string()))?;

        debug!(topic = topic, "Synthesizer responded");
        Ok(value)
    }
}
