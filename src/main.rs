use std::{convert::Infallible, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
    routing::{MethodRouter, any},
    serve::{Listener, ListenerExt},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::StreamExt;
use interlink::{
    adapters::{
        AuditListener, FileConfigProvider, HeaderAuthenticator, HttpClientAdapter,
        HttpConfigProvider, HttpHandler, PollingScheduler, SocketClientAdapter, SocketListeners,
        TracingAuditSink, TracingRecorder, http_handler::INTERNAL_ERROR_BODY, tls,
    },
    config::{
        ChannelType, ServerConfig, ServerConfigValidator, TlsConfig,
        loader::load_config_unchecked,
    },
    core::{GatewayService, MulticastDispatcher, SecondaryTasks},
    metrics,
    ports::config_provider::ConfigProvider,
    tracing_setup,
    utils::{ConnectionTracker, GracefulShutdown},
};
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file, or an http(s) URL of the administrative API
    #[clap(short, long, default_value = "interlink.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "interlink.yaml")]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        #[clap(short, long, default_value = "interlink.yaml")]
        config: String,
    },
    /// Start the switch (default)
    Serve {
        #[clap(short, long, default_value = "interlink.yaml")]
        config: String,
    },
}

/// Adapts a stream of accepted connections (e.g. a `TlsListener`) to `axum::serve`.
struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!(error = %e, "TLS accept error"),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// TLS-terminating ingress over an already bound listener.
fn tls_ingress(
    listener: TcpListener,
    tls_config: &TlsConfig,
) -> Result<AxumListener<TlsListener<TcpListener, TlsAcceptor>>> {
    let server_config =
        tls::server_config(tls_config).context("Failed to load ingress TLS material")?;
    let local_addr = listener.local_addr().context("Failed to get local addr")?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    Ok(AxumListener {
        stream: TlsListener::new(acceptor, listener),
        local_addr,
    })
}

fn create_config_provider(config_path: &str) -> Result<Arc<dyn ConfigProvider>> {
    match url::Url::parse(config_path) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Arc::new(
            HttpConfigProvider::new(url.to_string(), Duration::from_secs(10)),
        )),
        _ => Ok(Arc::new(FileConfigProvider::new(config_path)?)),
    }
}

/// Compile a validated configuration into a gateway snapshot.
///
/// Route clients are rebuilt with every snapshot so certificate profiles follow reloads.
/// `tasks` is shared by every snapshot so shutdown drains secondaries started under old ones.
fn build_gateway(config: Arc<ServerConfig>, tasks: &SecondaryTasks) -> Result<GatewayService> {
    let http_client = HttpClientAdapter::with_certificates(&config.certificates)
        .context("Failed to create HTTP route client")?;
    let socket_client = SocketClientAdapter::with_certificates(
        &config.certificates,
        config.router.max_body_bytes,
    )
    .context("Failed to create socket route client")?;
    let authenticator = HeaderAuthenticator::from_config(&config)?;

    let dispatcher = MulticastDispatcher::new(
        Arc::new(http_client),
        Arc::new(socket_client),
        Arc::new(TracingRecorder),
        tasks.clone(),
    );

    Ok(GatewayService::new(config, dispatcher)
        .context("Failed to compile channels")?
        .with_authenticator(Arc::new(authenticator)))
}

async fn load_validated(provider: &dyn ConfigProvider) -> Result<ServerConfig> {
    let config = provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load config from {}", provider.describe()))?;
    ServerConfigValidator::validate(&config)
        .with_context(|| format!("Invalid config from {}", provider.describe()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(config).await,
        None => serve(args.config).await,
    }
}

async fn serve(config_path: String) -> Result<()> {
    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {e}"))?;
    tls::ensure_crypto_provider();

    let config_provider =
        create_config_provider(&config_path).context("Failed to create config provider")?;
    tracing::info!(source = %config_provider.describe(), "Loading initial configuration");

    let initial_config = Arc::new(load_validated(config_provider.as_ref()).await?);
    let secondary_tasks = SecondaryTasks::new();
    let gateway_holder = Arc::new(ArcSwap::from_pointee(build_gateway(
        initial_config.clone(),
        &secondary_tasks,
    )?));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    {
        let graceful_shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = graceful_shutdown.run_signal_handler().await {
                tracing::error!(error = %e, "Signal handler error");
            }
        });
    }

    let connection_tracker = ConnectionTracker::new();

    let mut socket_listeners =
        SocketListeners::new(gateway_holder.clone(), connection_tracker.clone());
    socket_listeners
        .reconcile(&initial_config)
        .await
        .context("Failed to start socket listeners")?;

    let mut polling = PollingScheduler::new(gateway_holder.clone());
    polling.reschedule();

    let audit_task = match &initial_config.audit_listener {
        Some(audit) => {
            let listener = AuditListener::bind(&audit.listen_addr, Arc::new(TracingAuditSink))
                .await
                .context("Failed to start audit listener")?;
            Some(tokio::spawn(listener.run(graceful_shutdown.token())))
        }
        None => None,
    };

    // Reloads swap the gateway snapshot, then bring listeners and schedules in line with it.
    // On shutdown the same task stops the socket listeners it owns.
    let supervisor = {
        let gateway_holder = gateway_holder.clone();
        let secondary_tasks = secondary_tasks.clone();
        let config_provider = config_provider.clone();
        let shutdown = graceful_shutdown.token();
        let mut notify_rx = config_provider.watch();
        let debounce_duration = Duration::from_secs(2);

        tokio::spawn(async move {
            tracing::info!("Config watcher task started");
            let mut last_reload_attempt = tokio::time::Instant::now()
                .checked_sub(debounce_duration)
                .unwrap_or_else(tokio::time::Instant::now);

            loop {
                let changed = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = notify_rx.recv() => changed,
                };
                if changed.is_none() {
                    // Provider stopped watching; keep serving until shutdown
                    shutdown.cancelled().await;
                    break;
                }

                if last_reload_attempt.elapsed() < debounce_duration {
                    tracing::debug!("Debouncing config reload event");
                    while notify_rx.try_recv().is_ok() {}
                    continue;
                }
                last_reload_attempt = tokio::time::Instant::now();

                tracing::info!(source = %config_provider.describe(), "Reloading configuration");
                let reloaded = match load_validated(config_provider.as_ref()).await {
                    Ok(config) => {
                        let config = Arc::new(config);
                        build_gateway(config.clone(), &secondary_tasks).map(|g| (config, g))
                    }
                    Err(e) => Err(e),
                };

                match reloaded {
                    Ok((config, gateway)) => {
                        gateway_holder.store(Arc::new(gateway));
                        if let Err(e) = socket_listeners.reconcile(&config).await {
                            tracing::error!(error = ?e, "Failed to reconcile socket listeners");
                        }
                        polling.reschedule();
                        tracing::info!(channels = config.channels.len(), "Configuration reloaded");
                    }
                    Err(e) => {
                        tracing::error!(
                            error = ?e,
                            "Failed to reload configuration. Keeping old configuration"
                        );
                    }
                }
                while notify_rx.try_recv().is_ok() {}
            }

            polling.stop();
            let grace = Duration::from_secs(
                gateway_holder.load().config().router.socket_timeout_secs,
            );
            if !socket_listeners.shutdown(grace).await {
                tracing::warn!("Socket connections still open after {grace:?}");
            }
            tracing::info!("Config watcher task is shutting down");
        })
    };

    let addr: SocketAddr = initial_config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    let socket_channels = initial_config
        .channels
        .iter()
        .filter(|c| matches!(c.channel_type, ChannelType::Tcp | ChannelType::Tls))
        .count();
    tracing::info!(
        listen_addr = %addr,
        tls = initial_config.tls.is_some(),
        channels = initial_config.channels.len(),
        socket_channels,
        "Interlink starting"
    );
    println!(
        "Interlink listening on {} (TLS: {}, channels: {})",
        addr,
        initial_config.tls.is_some(),
        initial_config.channels.len()
    );

    let http_handler = Arc::new(
        HttpHandler::new(gateway_holder.clone(), connection_tracker.clone())
            .secure(initial_config.tls.is_some()),
    );
    let app = Router::new()
        .route("/{*path}", request_route(http_handler.clone()))
        .route("/", request_route(http_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::DEBUG)),
        );

    let server_shutdown = graceful_shutdown.token();
    let server_result = match &initial_config.tls {
        Some(tls_config) => {
            let tls_listener = tls_ingress(listener, tls_config)?.tap_io(|_io| {});

            axum::serve(
                tls_listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .context("Server error")
        }
        None => axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("Server error"),
    };

    if server_result.is_err() {
        graceful_shutdown.trigger_shutdown(interlink::utils::ShutdownReason::Requested);
    }

    let reason = graceful_shutdown.wait_for_shutdown_signal().await;
    tracing::info!(?reason, "Shutting down");

    finish_shutdown(
        supervisor,
        audit_task,
        &secondary_tasks,
        &connection_tracker,
        Duration::from_secs(initial_config.router.secondary_drain_secs),
    )
    .await;

    tracing_setup::shutdown_tracing();
    server_result
}

fn request_route(handler: Arc<HttpHandler>) -> MethodRouter {
    any(
        move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
            let handler = handler.clone();
            async move {
                match handler.handle_request(req, Some(client_addr)).await {
                    Ok(response) => Ok::<Response<Body>, Infallible>(response),
                    Err(e) => {
                        tracing::error!(error = ?e, "Request handling error");
                        let mut response = Response::new(Body::from(INTERNAL_ERROR_BODY));
                        *response.status_mut() = axum::http::StatusCode::INTERNAL_SERVER_ERROR;
                        Ok(response)
                    }
                }
            }
        },
    )
}

async fn finish_shutdown(
    supervisor: tokio::task::JoinHandle<()>,
    audit_task: Option<tokio::task::JoinHandle<()>>,
    secondary_tasks: &SecondaryTasks,
    connection_tracker: &ConnectionTracker,
    secondary_grace: Duration,
) {
    if let Err(e) = supervisor.await {
        tracing::error!(error = %e, "Config watcher task failed");
    }
    if let Some(audit_task) = audit_task
        && let Err(e) = audit_task.await
    {
        tracing::error!(error = %e, "Audit listener task failed");
    }

    let in_flight = secondary_tasks.in_flight();
    if in_flight > 0 {
        tracing::info!(in_flight, "Waiting for secondary routes");
    }
    if !secondary_tasks.drain(secondary_grace).await {
        tracing::warn!("Secondary routes cancelled at shutdown");
    }

    if !connection_tracker.wait_for_drain(Duration::from_secs(1)).await {
        let stats = connection_tracker.stats();
        tracing::warn!(
            http = stats.http_connections,
            socket = stats.socket_connections,
            "Exiting with open ingress connections"
        );
    }
    tracing::info!("Graceful shutdown completed");
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            let count = |kind: ChannelType| {
                config
                    .channels
                    .iter()
                    .filter(|c| c.channel_type == kind)
                    .count()
            };
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!(
                "   • Channels: {} (http: {}, tcp: {}, tls: {}, polling: {})",
                config.channels.len(),
                count(ChannelType::Http),
                count(ChannelType::Tcp),
                count(ChannelType::Tls),
                count(ChannelType::Polling)
            );
            println!(
                "   • Routes: {}",
                config.channels.iter().map(|c| c.routes.len()).sum::<usize>()
            );
            println!("   • Certificate Profiles: {}", config.certificates.len());
            println!("   • TLS Enabled: {}", config.tls.is_some());
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Give every enabled channel exactly one enabled primary route");
            println!("   • Check that certificate and key paths exist");
            println!("   • Verify listen address format (e.g., '0.0.0.0:5001')");
            println!("   • Use humantime intervals for polling channels (e.g., '30s', '5m')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Interlink configuration

# HTTP ingress
listen_addr: "0.0.0.0:5001"

router:
  http_timeout_secs: 60
  socket_timeout_secs: 60

clients:
  - client_id: lab-system
    roles: [lab]

channels:
  # Lab results go to the LIS; a copy is archived
  - name: lab results
    url_pattern: "^/lab"
    allow: [lab]
    routes:
      - name: lis
        host: localhost
        port: 8080
        primary: true
        path_transform: "s/lab/results"
      - name: archive
        host: localhost
        port: 8081

  # HL7v2 over MLLP
  - name: adt feed
    type: tcp
    tcp_host: 0.0.0.0
    tcp_port: 6661
    routes:
      - name: emr
        type: mllp
        host: localhost
        port: 6662
        primary: true
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'interlink serve --config {config_path}' to start the switch");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use axum::routing::get;
    use interlink::config::CertificateConfig;
    use rustls::pki_types::ServerName;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    use super::*;

    #[tokio::test]
    async fn test_tls_ingress_serves_with_peer_address() {
        tls::ensure_crypto_provider();
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert = NamedTempFile::new().unwrap();
        cert.write_all(generated.cert.pem().as_bytes()).unwrap();
        let mut key = NamedTempFile::new().unwrap();
        key.write_all(generated.signing_key.serialize_pem().as_bytes())
            .unwrap();
        let cert_path = cert.path().to_string_lossy().into_owned();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ingress = tls_ingress(
            listener,
            &TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key.path().to_string_lossy().into_owned(),
                client_ca_path: None,
            },
        )
        .unwrap()
        .tap_io(|_io| {});

        let app = Router::new().route(
            "/",
            get(|ConnectInfo(peer): ConnectInfo<SocketAddr>| async move {
                format!("peer {}", peer.ip())
            }),
        );
        tokio::spawn(async move {
            axum::serve(ingress, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        let client_config = tls::client_config(Some(&CertificateConfig {
            ca_path: Some(cert_path),
            cert_path: None,
            key_path: None,
        }))
        .unwrap();
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut stream = TlsConnector::from(Arc::new(client_config))
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => response.extend_from_slice(&buf[..n]),
                }
            }
        })
        .await
        .unwrap();

        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("peer 127.0.0.1"), "{response}");
    }
}
