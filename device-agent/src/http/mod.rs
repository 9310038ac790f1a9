//! # HTTP Client Capability
//!
//! The credential client reaches the platform through [`HttpClient`] so
//! tests can substitute canned responses. [`ReqwestHttpClient`] is the
//! default implementation.

use async_trait::async_trait;
use tracing::debug;

use shared::{
    config::HttpConfig,
    error::{AgentError, AgentResult},
};

/// Status and body of an HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Minimal HTTP capability: one POST verb
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST `body` to `url`. Any HTTP status is a response; only a failure
    /// to exchange the request is an error.
    async fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> AgentResult<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Build a client honouring the configured timeout
    pub fn new(config: &HttpConfig) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AgentError::ConfigurationError(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing `reqwest` client
    pub fn from_reqwest(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> AgentResult<HttpResponse> {
        let http_error = |e: reqwest::Error| AgentError::HttpError {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(http_error)?.to_vec();

        debug!(url = %url, status, bytes = body.len(), "HTTP response received");

        Ok(HttpResponse { status, body })
    }
}
