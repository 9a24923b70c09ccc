//! TCP, TLS and MLLP ingress listeners.
//!
//! One listener runs per distinct `tcp_host:tcp_port` of the enabled `tcp` and `tls` channels.
//! [`SocketListeners::reconcile`] brings the running set in line with a configuration snapshot:
//! listeners whose channel disappeared are cancelled, new ones are bound, unchanged ones keep
//! serving.
//!
//! Every accepted connection walks
//! `Accepted → Reading → Matched → Dispatching → Responding → Closed`, or ends in `Error` when
//! the peer misbehaves, no channel is bound to the listener, or the primary route fails. Errors
//! close the connection without a reply.
//!
//! Message boundaries: a message ending in `0x1C 0x0D` is MLLP framed; the reply is framed the
//! same way and the connection stays open for the next message. Anything else is read until the
//! peer half-closes or the socket timeout passes, answered once, then the connection closes.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use eyre::{Result, WrapErr};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    adapters::tls,
    config::{ChannelType, ServerConfig},
    core::{
        GatewayError, GatewayService,
        framing::{MLLP_START, frame_mllp, mllp_frame_end},
        matcher::IngressProtocol,
        request::InboundRequest,
    },
    metrics,
    utils::ConnectionTracker,
};

/// Identity of a socket listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub host: String,
    pub port: u16,
    pub protocol: ChannelType,
}

impl ListenerKey {
    fn ingress(&self) -> IngressProtocol {
        match self.protocol {
            ChannelType::Tls => IngressProtocol::Tls,
            _ => IngressProtocol::Tcp,
        }
    }

    /// Listeners needed by the enabled socket channels of `config`.
    pub fn desired(config: &ServerConfig) -> Vec<ListenerKey> {
        let mut keys: Vec<ListenerKey> = Vec::new();
        for channel in config.channels.iter().filter(|c| c.is_enabled()) {
            if !matches!(channel.channel_type, ChannelType::Tcp | ChannelType::Tls) {
                continue;
            }
            if let (Some(host), Some(port)) = (&channel.tcp_host, channel.tcp_port) {
                let key = ListenerKey {
                    host: host.clone(),
                    port,
                    protocol: channel.channel_type,
                };
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

impl std::fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Lifecycle of one accepted socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    Accepted,
    Reading,
    Matched,
    Dispatching,
    Responding,
    Closed,
    Error,
}

/// One message read from a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundMessage {
    /// Ended by the MLLP terminator; replies are framed
    Framed(Bytes),
    /// Ended by half-close or the read deadline
    Unframed(Bytes),
    /// Peer closed between messages
    Closed,
    /// Peer closed in the middle of an MLLP frame
    Truncated(usize),
}

/// Read the next message from `stream`, keeping unread bytes in `buf` for the next call.
///
/// Cancel-safe: partially read data stays in `buf` when the future is dropped.
pub async fn read_message<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_bytes: usize,
) -> std::io::Result<InboundMessage>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = mllp_frame_end(buf) {
            return Ok(InboundMessage::Framed(buf.split_to(end).freeze()));
        }
        if buf.len() > max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message exceeds {max_bytes} bytes"),
            ));
        }

        if stream.read_buf(buf).await? == 0 {
            return Ok(take_unterminated(buf));
        }
    }
}

/// Classify whatever is left in `buf` once no more data will arrive.
fn take_unterminated(buf: &mut BytesMut) -> InboundMessage {
    let content = buf.iter().position(|b| !b.is_ascii_whitespace());
    match content {
        None => {
            buf.clear();
            InboundMessage::Closed
        }
        Some(start) if buf[start] == MLLP_START => {
            let pending = buf.len();
            buf.clear();
            InboundMessage::Truncated(pending)
        }
        Some(_) => InboundMessage::Unframed(buf.split().freeze()),
    }
}

struct RunningListener {
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

/// The set of running socket listeners.
pub struct SocketListeners {
    gateway: Arc<ArcSwap<GatewayService>>,
    running: HashMap<ListenerKey, RunningListener>,
    shutdown: CancellationToken,
    connections: TaskTracker,
    tracker: ConnectionTracker,
}

impl SocketListeners {
    pub fn new(gateway: Arc<ArcSwap<GatewayService>>, tracker: ConnectionTracker) -> Self {
        Self {
            gateway,
            tracker,
            running: HashMap::new(),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Bound address of a running listener.
    pub fn local_addr(&self, key: &ListenerKey) -> Option<SocketAddr> {
        self.running.get(key).map(|l| l.local_addr)
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Start and stop listeners to match `config`.
    ///
    /// A listener that fails to bind is logged and skipped; the others still start.
    pub async fn reconcile(&mut self, config: &ServerConfig) -> Result<()> {
        let desired = ListenerKey::desired(config);

        let stale: Vec<ListenerKey> = self
            .running
            .keys()
            .filter(|key| !desired.contains(key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(listener) = self.running.remove(&key) {
                tracing::info!(listener = %key, "Stopping socket listener");
                listener.cancel.cancel();
            }
        }

        let needs_tls = desired
            .iter()
            .any(|k| k.protocol == ChannelType::Tls && !self.running.contains_key(k));
        let acceptor = match (&config.tls, needs_tls) {
            (Some(tls_config), true) => Some(TlsAcceptor::from(Arc::new(
                tls::server_config(tls_config).wrap_err("Failed to load TLS listener material")?,
            ))),
            _ => None,
        };

        for key in desired {
            if self.running.contains_key(&key) {
                continue;
            }
            let acceptor = match key.protocol {
                ChannelType::Tls => match &acceptor {
                    Some(acceptor) => Some(acceptor.clone()),
                    None => {
                        tracing::error!(
                            listener = %key,
                            "TLS channel configured without server TLS material"
                        );
                        continue;
                    }
                },
                _ => None,
            };

            match self.start(key.clone(), acceptor).await {
                Ok(listener) => {
                    tracing::info!(
                        listener = %key,
                        local_addr = %listener.local_addr,
                        "Socket listener started"
                    );
                    self.running.insert(key, listener);
                }
                Err(e) => {
                    tracing::error!(listener = %key, error = %e, "Failed to start socket listener")
                }
            }
        }

        Ok(())
    }

    async fn start(
        &self,
        key: ListenerKey,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<RunningListener> {
        let listener = TcpListener::bind((key.host.as_str(), key.port))
            .await
            .wrap_err_with(|| format!("Failed to bind {key}"))?;
        let local_addr = listener.local_addr().wrap_err("Failed to get local addr")?;

        let cancel = self.shutdown.child_token();
        let accept_loop = AcceptLoop {
            key: Arc::new(key),
            listener,
            acceptor,
            gateway: self.gateway.clone(),
            cancel: cancel.clone(),
            connections: self.connections.clone(),
            tracker: self.tracker.clone(),
        };
        tokio::spawn(accept_loop.run());

        Ok(RunningListener { cancel, local_addr })
    }

    /// Stop accepting, then wait up to `grace` for open connections to finish.
    pub async fn shutdown(&mut self, grace: Duration) -> bool {
        tracing::info!(listeners = self.running.len(), "Stopping socket listeners");
        self.shutdown.cancel();
        self.running.clear();
        self.connections.close();
        timeout(grace, self.connections.wait()).await.is_ok()
    }
}

struct AcceptLoop {
    key: Arc<ListenerKey>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    gateway: Arc<ArcSwap<GatewayService>>,
    cancel: CancellationToken,
    connections: TaskTracker,
    tracker: ConnectionTracker,
}

impl AcceptLoop {
    async fn run(self) {
        tracing::debug!(
            listener = %self.key,
            state = ?ConnectionState::Listening,
            "Accepting connections"
        );
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    metrics::increment_socket_connections(&self.key.protocol.to_string());
                    let connection = Connection {
                        key: self.key.clone(),
                        peer,
                        gateway: self.gateway.clone(),
                        cancel: self.cancel.clone(),
                        state: ConnectionState::Accepted,
                    };
                    let span = tracing::info_span!(
                        "socket_connection",
                        listener = %self.key,
                        peer = %peer,
                    );
                    let acceptor = self.acceptor.clone();
                    let ingress = match self.key.protocol {
                        ChannelType::Tls => "tls",
                        _ => "tcp",
                    };
                    let guard = self.tracker.track(peer, ingress);
                    self.connections.spawn(
                        async move {
                            let _guard = guard;
                            connection.handle(stream, acceptor).await
                        }
                        .instrument(span),
                    );
                }
                Err(e) => tracing::warn!(listener = %self.key, error = %e, "Accept error"),
            }
        }
        tracing::debug!(listener = %self.key, "Socket listener stopped");
    }
}

struct Connection {
    key: Arc<ListenerKey>,
    peer: SocketAddr,
    gateway: Arc<ArcSwap<GatewayService>>,
    cancel: CancellationToken,
    state: ConnectionState,
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        tracing::trace!(from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    fn fail(&mut self, reason: &str) {
        tracing::warn!(state = ?self.state, reason, "Closing socket connection");
        self.transition(ConnectionState::Error);
    }

    async fn handle(mut self, stream: TcpStream, acceptor: Option<TlsAcceptor>) {
        let _ = stream.set_nodelay(true);
        let handshake_timeout =
            Duration::from_secs(self.gateway.load().config().router.socket_timeout_secs);

        match acceptor {
            Some(acceptor) => match timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => self.serve(tls_stream, true).await,
                Ok(Err(e)) => self.fail(&format!("TLS handshake failed: {e}")),
                Err(_) => self.fail("TLS handshake timed out"),
            },
            None => self.serve(stream, false).await,
        }

        if self.state == ConnectionState::Error {
            self.transition(ConnectionState::Closed);
        }
    }

    async fn serve<S>(&mut self, mut stream: S, secure: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            self.transition(ConnectionState::Reading);
            let gateway = self.gateway.load_full();
            let router = &gateway.config().router;
            let deadline = Duration::from_secs(router.socket_timeout_secs);

            let next = read_message(&mut stream, &mut buf, router.max_body_bytes);
            let read = tokio::select! {
                _ = self.cancel.cancelled() => None,
                read = timeout(deadline, next) => Some(read),
            };
            let Some(read) = read else {
                self.transition(ConnectionState::Closed);
                return;
            };

            let (payload, framed) = match read {
                Ok(Ok(InboundMessage::Framed(payload))) => (payload, true),
                Ok(Ok(InboundMessage::Unframed(payload))) => (payload, false),
                Ok(Ok(InboundMessage::Closed)) => {
                    self.transition(ConnectionState::Closed);
                    return;
                }
                Ok(Ok(InboundMessage::Truncated(pending))) => {
                    self.fail(&format!(
                        "peer disconnected mid-message with {pending} bytes pending"
                    ));
                    return;
                }
                Ok(Err(e)) => {
                    self.fail(&format!("read failed: {e}"));
                    return;
                }
                // Silent peers get whatever they sent so far treated as a complete message
                Err(_) => match take_unterminated(&mut buf) {
                    InboundMessage::Unframed(payload) => (payload, false),
                    InboundMessage::Truncated(pending) => {
                        self.fail(&format!(
                            "read timed out mid-message with {pending} bytes pending"
                        ));
                        return;
                    }
                    _ => {
                        tracing::debug!("Idle socket connection timed out");
                        self.transition(ConnectionState::Closed);
                        return;
                    }
                },
            };

            let matched = gateway.match_socket(&self.key.host, self.key.port, self.key.ingress());
            let channel = match matched {
                Ok(channel) => channel,
                Err(e) => {
                    self.fail(&e.to_string());
                    return;
                }
            };
            self.transition(ConnectionState::Matched);
            tracing::debug!(
                channel = %channel.name,
                bytes = payload.len(),
                framed,
                "Socket message matched"
            );

            self.transition(ConnectionState::Dispatching);
            let request = InboundRequest::socket(payload, Some(self.peer), secure);
            let reply = match gateway.dispatch(channel, request).await {
                Ok(dispatched) => dispatched.response.body,
                Err(e @ GatewayError::Dispatch(_)) => {
                    tracing::error!(error = %e, "Socket dispatch failed");
                    self.fail("dispatch failed");
                    return;
                }
                Err(e) => {
                    self.fail(&e.to_string());
                    return;
                }
            };

            self.transition(ConnectionState::Responding);
            let reply = if framed { frame_mllp(&reply) } else { reply };
            let written = async {
                stream.write_all(&reply).await?;
                stream.flush().await
            };
            if let Err(e) = written.await {
                self.fail(&format!("write failed: {e}"));
                return;
            }

            if !framed {
                let _ = stream.shutdown().await;
                self.transition(ConnectionState::Closed);
                return;
            }
        }
    }
}
