// Integration tests for tcp channels served by the socket listeners
use std::{net::SocketAddr, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use interlink::{
    adapters::{
        HttpClientAdapter, InMemoryRecorder, ListenerKey, SocketClientAdapter, SocketListeners,
    },
    config::{ChannelConfig, ChannelType, RouteConfig, RouteType, ServerConfig},
    core::{GatewayService, MulticastDispatcher, SecondaryTasks, framing::mllp_frame_end},
    utils::ConnectionTracker,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

const ACK: &[u8] = b"\x0bMSA|AA\r\x1c\r";

/// MLLP upstream that acknowledges every frame after `delay` and reports what it received.
async fn mllp_upstream(delay: Duration) -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                let mut buf = [0u8; 512];
                while mllp_frame_end(&seen).is_none() {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    seen.extend_from_slice(&buf[..n]);
                }
                let _ = tx.send(seen);
                tokio::time::sleep(delay).await;
                socket.write_all(ACK).await.unwrap();
            });
        }
    });

    (port, rx)
}

/// Plain TCP upstream that upper-cases everything it reads before the client half-closes.
async fn shouting_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut request = Vec::new();
                socket.read_to_end(&mut request).await.unwrap();
                socket.write_all(&request.to_ascii_uppercase()).await.unwrap();
            });
        }
    });
    port
}

async fn start_listeners(route: RouteConfig) -> (SocketListeners, SocketAddr) {
    let config = ServerConfig::builder()
        .listen_addr("127.0.0.1:0")
        .channel(
            ChannelConfig::socket("adt feed", ChannelType::Tcp, "127.0.0.1", 0).with_route(route),
        )
        .build()
        .unwrap();

    let dispatcher = MulticastDispatcher::new(
        Arc::new(HttpClientAdapter::new().unwrap()),
        Arc::new(SocketClientAdapter::new(1024 * 1024).unwrap()),
        Arc::new(InMemoryRecorder::new()),
        SecondaryTasks::new(),
    );
    let gateway = GatewayService::new(Arc::new(config.clone()), dispatcher).unwrap();

    let mut listeners = SocketListeners::new(
        Arc::new(ArcSwap::from_pointee(gateway)),
        ConnectionTracker::new(),
    );
    listeners.reconcile(&config).await.unwrap();

    let key = ListenerKey {
        host: "127.0.0.1".into(),
        port: 0,
        protocol: ChannelType::Tcp,
    };
    let addr = listeners.local_addr(&key).expect("listener bound");
    (listeners, addr)
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut reply = Vec::new();
    let mut buf = [0u8; 512];
    tokio::time::timeout(Duration::from_secs(5), async {
        while mllp_frame_end(&reply).is_none() {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before a full reply");
            reply.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("no reply from the listener");
    reply
}

#[tokio::test(flavor = "multi_thread")]
async fn test_framed_messages_share_one_connection() {
    let (port, mut seen) = mllp_upstream(Duration::ZERO).await;
    let (mut listeners, addr) = start_listeners(
        RouteConfig::new("ehr", "127.0.0.1", port)
            .primary()
            .with_type(RouteType::Mllp),
    )
    .await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(b"\x0bMSH|1\r\x1c\r").await.unwrap();
    assert_eq!(read_frame(&mut client).await, ACK);
    assert_eq!(seen.recv().await.unwrap(), b"\x0bMSH|1\r\x1c\r");

    client.write_all(b"\x0bMSH|2\r\x1c\r").await.unwrap();
    assert_eq!(read_frame(&mut client).await, ACK);
    assert_eq!(seen.recv().await.unwrap(), b"\x0bMSH|2\r\x1c\r");

    drop(client);
    assert!(listeners.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unframed_message_gets_one_reply_then_close() {
    let port = shouting_upstream().await;
    let (mut listeners, addr) = start_listeners(
        RouteConfig::new("legacy", "127.0.0.1", port)
            .primary()
            .with_type(RouteType::Tcp),
    )
    .await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello switch").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .expect("listener did not close the connection")
        .unwrap();
    assert_eq!(reply, b"HELLO SWITCH");

    assert!(listeners.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_mid_frame_is_not_dispatched() {
    let (port, mut seen) = mllp_upstream(Duration::ZERO).await;
    let (mut listeners, addr) = start_listeners(
        RouteConfig::new("ehr", "127.0.0.1", port)
            .primary()
            .with_type(RouteType::Mllp),
    )
    .await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"\x0bMSH|partial").await.unwrap();
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .expect("listener kept the connection open")
        .unwrap();
    assert!(reply.is_empty());

    let upstream = tokio::time::timeout(Duration::from_millis(300), seen.recv()).await;
    assert!(upstream.is_err(), "truncated frame reached the upstream");

    assert!(listeners.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_leaving_during_dispatch_does_not_block_the_listener() {
    let (port, mut seen) = mllp_upstream(Duration::from_millis(500)).await;
    let (mut listeners, addr) = start_listeners(
        RouteConfig::new("slow ehr", "127.0.0.1", port)
            .primary()
            .with_type(RouteType::Mllp),
    )
    .await;

    let mut impatient = TcpStream::connect(addr).await.unwrap();
    impatient.write_all(b"\x0bMSH|1\r\x1c\r").await.unwrap();
    assert_eq!(seen.recv().await.unwrap(), b"\x0bMSH|1\r\x1c\r");
    drop(impatient);

    let mut patient = TcpStream::connect(addr).await.unwrap();
    patient.write_all(b"\x0bMSH|2\r\x1c\r").await.unwrap();
    assert_eq!(read_frame(&mut patient).await, ACK);
    assert_eq!(seen.recv().await.unwrap(), b"\x0bMSH|2\r\x1c\r");

    drop(patient);
    assert!(listeners.shutdown(Duration::from_secs(5)).await);
}
