//! HTTP transport used for update-check requests.
//!
//! The protocol layer only ever POSTs a small XML document and reads back
//! a small XML document, so the transport seam is a single blocking call.
//! Production uses [`ReqwestClient`]; tests swap in the mock from
//! [`tests`] to script responses without a network.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Errors from the HTTP transport.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Connection, DNS, TLS, or timeout failure before a response arrived.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The response body could not be read.
    #[error("failed reading response body: {0}")]
    Body(String),

    /// The client was constructed with invalid settings.
    #[error("invalid client configuration: {0}")]
    Configuration(String),
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponseData {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponseData {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP POST transport.
pub trait HttpClient: Send + Sync {
    /// POST `body` to `url` with content type `text/xml` and return the
    /// response. A non-2xx status is a successful call; only transport
    /// failures are errors.
    fn post(&self, url: &str, body: &str) -> Result<HttpResponseData, HttpError>;
}

/// Production transport backed by `reqwest`'s blocking client.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Build a client with the given total request timeout.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Configuration(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn post(&self, url: &str, body: &str) -> Result<HttpResponseData, HttpError> {
        debug!(url, bytes = body.len(), "posting update request");
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body.to_string())
            .send()
            .map_err(|e| HttpError::Transfer(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| HttpError::Body(e.to_string()))?
            .to_vec();
        debug!(status, bytes = body.len(), "received update response");
        Ok(HttpResponseData { status, body })
    }
}
