use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuditSinkError {
    #[error("audit sink rejected message: {0}")]
    Rejected(String),
}

/// Receives audit messages decoded by the audit intake listener.
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn submit(&self, message: Bytes, peer: SocketAddr) -> Result<(), AuditSinkError>;
}
