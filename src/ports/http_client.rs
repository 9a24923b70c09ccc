use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::core::channel::Route;

/// Custom error type for HTTP route forwarding
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// TLS handshake or verification failure
    #[error("TLS error: {0}")]
    TlsError(String),

    /// Error when request times out
    #[error("Timeout error after {0} ms")]
    Timeout(u128),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream response body could not be read
    #[error("Failed to read response body: {0}")]
    BodyError(String),

    /// The route references a certificate profile that is not configured
    #[error("Unknown certificate profile: {0}")]
    UnknownCertificate(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// A request ready to send to one route. Headers have already been through the
/// forwarding policy; the client only adds `Host` and framing headers.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Rewritten path, always starting with `/`
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// Fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HttpClient defines the port (interface) for forwarding a request to an HTTP route
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send `request` to `route`, honouring its TLS settings and timeout.
    ///
    /// # Returns
    /// The buffered upstream response, or an error on connection failure, TLS failure or timeout.
    /// Non-2xx statuses are responses, not errors.
    async fn forward(
        &self,
        route: &Route,
        request: OutboundRequest,
    ) -> HttpClientResult<UpstreamResponse>;
}
