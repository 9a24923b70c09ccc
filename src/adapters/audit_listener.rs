//! Audit message intake over TCP.
//!
//! Messages arrive as `"<byteLength> <payload>"`, several per connection if the sender likes,
//! and are handed one by one to an [`AuditSink`].
use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use eyre::{Result, WrapErr};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{codec::FramedRead, sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    core::framing::LengthPrefixedCodec,
    ports::audit_sink::{AuditSink, AuditSinkError},
};

/// Logs each audit message on the `interlink::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn submit(&self, message: Bytes, peer: SocketAddr) -> Result<(), AuditSinkError> {
        tracing::info!(
            target: "interlink::audit",
            peer = %peer,
            bytes = message.len(),
            message = %String::from_utf8_lossy(&message),
            "Audit message received"
        );
        Ok(())
    }
}

pub struct AuditListener {
    listener: TcpListener,
    sink: Arc<dyn AuditSink>,
    connections: TaskTracker,
}

impl AuditListener {
    pub async fn bind(addr: &str, sink: Arc<dyn AuditSink>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("Failed to bind audit listener on {addr}"))?;
        Ok(Self {
            listener,
            sink,
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().wrap_err("Failed to get local addr")
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(local_addr = ?self.listener.local_addr().ok(), "Audit listener started");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let span = tracing::info_span!("audit_connection", peer = %peer);
                    self.connections.spawn(
                        receive(stream, peer, self.sink.clone(), cancel.clone()).instrument(span),
                    );
                }
                Err(e) => tracing::warn!(error = %e, "Audit accept error"),
            }
        }
        self.connections.close();
        self.connections.wait().await;
        tracing::info!("Audit listener stopped");
    }
}

async fn receive(
    stream: TcpStream,
    peer: SocketAddr,
    sink: Arc<dyn AuditSink>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, LengthPrefixedCodec::new());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                if let Err(e) = sink.submit(message, peer).await {
                    tracing::warn!(error = %e, "Audit message rejected");
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Dropping audit connection");
                break;
            }
            None => break,
        }
    }
}
