use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use eyre::{Result, WrapErr};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsConnector;

use crate::{
    adapters::tls,
    config::{CertificateConfig, RouteType},
    core::{channel::Route, framing::mllp_frame_end},
    ports::socket_client::{SocketClient, SocketClientError, SocketClientResult},
};

/// Socket route adapter for `tcp` and `mllp` routes, optionally over TLS.
///
/// `tcp` routes get the payload followed by a write shutdown and answer until they close.
/// `mllp` routes keep the connection open and answer until the `0x1C 0x0D` terminator.
/// Either kind may end its reply early with the terminator. The payload is written as is;
/// MLLP framing is the message's own concern.
pub struct SocketClientAdapter {
    default_tls: TlsConnector,
    profiles: HashMap<String, TlsConnector>,
    max_response_bytes: usize,
}

impl SocketClientAdapter {
    pub fn new(max_response_bytes: usize) -> Result<Self> {
        Self::with_certificates(&HashMap::new(), max_response_bytes)
    }

    pub fn with_certificates(
        certificates: &HashMap<String, CertificateConfig>,
        max_response_bytes: usize,
    ) -> Result<Self> {
        let default_tls = TlsConnector::from(Arc::new(tls::client_config(None)?));

        let mut profiles = HashMap::new();
        for (name, profile) in certificates {
            let config = tls::client_config(Some(profile))
                .wrap_err_with(|| format!("certificate profile '{name}'"))?;
            profiles.insert(name.clone(), TlsConnector::from(Arc::new(config)));
        }

        Ok(Self {
            default_tls,
            profiles,
            max_response_bytes,
        })
    }

    fn connector_for(&self, route: &Route) -> SocketClientResult<&TlsConnector> {
        match &route.cert {
            Some(name) => self
                .profiles
                .get(name)
                .ok_or_else(|| SocketClientError::UnknownCertificate(name.clone())),
            None => Ok(&self.default_tls),
        }
    }

    async fn exchange<S>(
        &self,
        mut stream: S,
        kind: RouteType,
        payload: &[u8],
    ) -> std::io::Result<Bytes>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(payload).await?;
        stream.flush().await?;
        if kind == RouteType::Tcp {
            stream.shutdown().await?;
        }

        let mut response = BytesMut::with_capacity(4096);
        loop {
            let read = stream.read_buf(&mut response).await?;
            if read == 0 || mllp_frame_end(&response).is_some() {
                break;
            }
            if response.len() > self.max_response_bytes {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("response exceeds {} bytes", self.max_response_bytes),
                ));
            }
        }

        if let Some(end) = mllp_frame_end(&response) {
            response.truncate(end);
        }
        Ok(response.freeze())
    }

    async fn forward_inner(&self, route: &Route, payload: &[u8]) -> SocketClientResult<Bytes> {
        let authority = route.authority();
        let io_error = |e: std::io::Error| SocketClientError::Io(authority.clone(), e.to_string());

        let stream = TcpStream::connect((route.host.as_str(), route.port))
            .await
            .map_err(|e| SocketClientError::ConnectionError(authority.clone(), e.to_string()))?;
        let _ = stream.set_nodelay(true);

        if !route.secured {
            return self.exchange(stream, route.kind, payload).await.map_err(io_error);
        }

        let connector = self.connector_for(route)?;
        let server_name = ServerName::try_from(route.host.clone())
            .map_err(|e| SocketClientError::TlsError(authority.clone(), e.to_string()))?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| SocketClientError::TlsError(authority.clone(), e.to_string()))?;

        self.exchange(tls_stream, route.kind, payload)
            .await
            .map_err(io_error)
    }
}

#[async_trait]
impl SocketClient for SocketClientAdapter {
    async fn forward(&self, route: &Route, payload: Bytes) -> SocketClientResult<Bytes> {
        tracing::debug!(
            upstream = %route.authority(),
            kind = %route.kind,
            secured = route.secured,
            bytes = payload.len(),
            "Forwarding socket payload"
        );

        match timeout(route.timeout, self.forward_inner(route, &payload)).await {
            Ok(result) => result,
            Err(_) => Err(SocketClientError::Timeout(route.authority(), route.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::config::{ChannelConfig, ChannelType, RouteConfig, RouterConfig};
    use crate::core::channel::Channel;

    fn route(port: u16, kind: RouteType) -> Route {
        let channel = ChannelConfig::socket("c", ChannelType::Tcp, "127.0.0.1", 1)
            .with_route(RouteConfig::new("r", "127.0.0.1", port).primary().with_type(kind));
        let mut route = Channel::compile(0, &channel, &RouterConfig::default())
            .unwrap()
            .routes
            .remove(0);
        route.timeout = Duration::from_secs(2);
        route
    }

    #[tokio::test]
    async fn test_tcp_route_reads_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            socket.write_all(&request.to_ascii_uppercase()).await.unwrap();
        });

        let client = SocketClientAdapter::new(1024).unwrap();
        let reply = client
            .forward(&route(port, RouteType::Tcp), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"PING");
    }

    #[tokio::test]
    async fn test_mllp_route_stops_at_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let mut seen = Vec::new();
            while mllp_frame_end(&seen).is_none() {
                let n = socket.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            socket.write_all(b"\x0bMSA|AA\r\x1c\r").await.unwrap();
            // keep the connection open; the client must not wait for close
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = SocketClientAdapter::new(1024).unwrap();
        let reply = client
            .forward(
                &route(port, RouteType::Mllp),
                Bytes::from_static(b"\x0bMSH|^~\\&|ADT\r\x1c\r"),
            )
            .await
            .unwrap();
        assert_eq!(&reply[..], b"\x0bMSA|AA\r\x1c\r");
    }

    #[tokio::test]
    async fn test_silent_upstream_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut silent = route(port, RouteType::Mllp);
        silent.timeout = Duration::from_millis(100);

        let client = SocketClientAdapter::new(1024).unwrap();
        let err = client
            .forward(&silent, Bytes::from_static(b"\x0bMSH\r\x1c\r"))
            .await
            .unwrap_err();
        assert!(matches!(err, SocketClientError::Timeout(_, _)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = SocketClientAdapter::new(1024).unwrap();
        let err = client
            .forward(&route(port, RouteType::Tcp), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SocketClientError::ConnectionError(_, _)));
    }
}
