use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::core::channel::Route;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SocketClientError {
    #[error("Connection to {0} failed: {1}")]
    ConnectionError(String, String),

    #[error("TLS error talking to {0}: {1}")]
    TlsError(String, String),

    #[error("No response from {0} within {1:?}")]
    Timeout(String, Duration),

    #[error("I/O error talking to {0}: {1}")]
    Io(String, String),

    #[error("Unknown certificate profile: {0}")]
    UnknownCertificate(String),
}

pub type SocketClientResult<T> = Result<T, SocketClientError>;

/// Forwards raw payloads to `tcp` and `mllp` routes.
///
/// One connection per call; nothing is pooled.
#[async_trait]
pub trait SocketClient: Send + Sync + 'static {
    /// Write `payload` to `route` and return everything it answers with.
    async fn forward(&self, route: &Route, payload: Bytes) -> SocketClientResult<Bytes>;
}
