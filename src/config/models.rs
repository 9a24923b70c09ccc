//! Configuration data structures for interlink.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files and to the JSON
//! records served by the administrative collaborator. They are serde‑friendly and carry
//! defaults so that minimal configs remain concise. At load time they are compiled into the
//! immutable descriptors under [`crate::core::channel`]; nothing here is consulted on the hot path.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_socket_timeout_secs() -> u64 {
    60
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_secondary_drain_secs() -> u64 {
    10
}

fn default_identity_header() -> String {
    "x-client-id".to_string()
}

/// Top-level switch configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP ingress address (`IP:PORT`)
    pub listen_addr: String,
    /// Server certificate for the HTTPS ingress and `tls` channel listeners
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    /// Channels in insertion order; order breaks priority ties
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Named TLS profiles referenced by `route.cert`
    #[serde(default)]
    pub certificates: HashMap<String, CertificateConfig>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub audit_listener: Option<AuditListenerConfig>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Look up a channel by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5001".to_string(),
            tls: None,
            router: RouterConfig::default(),
            channels: Vec::new(),
            certificates: HashMap::new(),
            clients: Vec::new(),
            auth: AuthConfig::default(),
            audit_listener: None,
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<String>,
    tls: Option<TlsConfig>,
    router: Option<RouterConfig>,
    channels: Vec<ChannelConfig>,
    certificates: HashMap<String, CertificateConfig>,
    clients: Vec<ClientConfig>,
    auth: Option<AuthConfig>,
    audit_listener: Option<AuditListenerConfig>,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Set TLS configuration with manual certificate paths
    pub fn tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            client_ca_path: None,
        });
        self
    }

    pub fn router(mut self, router: RouterConfig) -> Self {
        self.router = Some(router);
        self
    }

    /// Append a channel; channels keep their insertion order
    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channels.push(channel);
        self
    }

    /// Register a named TLS profile for routes to reference
    pub fn certificate(mut self, name: impl Into<String>, cert: CertificateConfig) -> Self {
        self.certificates.insert(name.into(), cert);
        self
    }

    pub fn client(mut self, client_id: impl Into<String>, roles: Vec<String>) -> Self {
        self.clients.push(ClientConfig {
            client_id: client_id.into(),
            roles,
        });
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn audit_listener(mut self, listen_addr: impl Into<String>) -> Self {
        self.audit_listener = Some(AuditListenerConfig {
            listen_addr: listen_addr.into(),
        });
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| "listen_addr is required".to_string())?;

        if self.channels.is_empty() {
            return Err("At least one channel must be configured".to_string());
        }

        Ok(ServerConfig {
            listen_addr,
            tls: self.tls,
            router: self.router.unwrap_or_default(),
            channels: self.channels,
            certificates: self.certificates,
            clients: self.clients,
            auth: self.auth.unwrap_or_default(),
            audit_listener: self.audit_listener,
        })
    }
}

/// Server-side TLS material.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    /// Path to PEM encoded certificate chain
    pub cert_path: String,
    /// Path to PEM encoded private key
    pub key_path: String,
    /// Optional CA bundle; when present, client certificates are requested and verified
    #[serde(default)]
    pub client_ca_path: Option<String>,
}

/// Dispatch tunables shared by every channel.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
    /// Largest inbound body or socket payload accepted, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// How long shutdown waits for in-flight secondary routes
    #[serde(default = "default_secondary_drain_secs")]
    pub secondary_drain_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
            socket_timeout_secs: default_socket_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            secondary_drain_secs: default_secondary_drain_secs(),
        }
    }
}

/// Named TLS profile used when dialling secured routes.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CertificateConfig {
    /// Additional trust anchors (PEM) for verifying the upstream
    #[serde(default)]
    pub ca_path: Option<String>,
    /// Client certificate chain (PEM) presented to the upstream
    #[serde(default)]
    pub cert_path: Option<String>,
    /// Private key (PEM) matching `cert_path`
    #[serde(default)]
    pub key_path: Option<String>,
}

/// A caller known to the header authenticator.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    /// Header carrying the caller id, set by the authenticating front proxy
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            identity_header: default_identity_header(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditListenerConfig {
    pub listen_addr: String,
}

/// Inbound protocol family a channel accepts.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    Http,
    Tcp,
    Tls,
    Polling,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Http => write!(f, "http"),
            ChannelType::Tcp => write!(f, "tcp"),
            ChannelType::Tls => write!(f, "tls"),
            ChannelType::Polling => write!(f, "polling"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    Disabled,
    Deleted,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    #[default]
    Enabled,
    Disabled,
}

/// Upstream protocol of a route.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    Http,
    Tcp,
    Mllp,
}

impl RouteType {
    /// Route type used when a route does not name one.
    pub fn inherited_from(channel_type: ChannelType) -> Self {
        match channel_type {
            ChannelType::Http | ChannelType::Polling => RouteType::Http,
            ChannelType::Tcp | ChannelType::Tls => RouteType::Tcp,
        }
    }

    pub fn is_socket(self) -> bool {
        matches!(self, RouteType::Tcp | RouteType::Mllp)
    }
}

impl std::fmt::Display for RouteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteType::Http => write!(f, "http"),
            RouteType::Tcp => write!(f, "tcp"),
            RouteType::Mllp => write!(f, "mllp"),
        }
    }
}

/// A named routing rule mapping inbound criteria to upstream routes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Regular expression matched (unanchored) against the request path
    #[serde(default)]
    pub url_pattern: String,
    #[serde(default, rename = "type")]
    pub channel_type: ChannelType,
    /// Client ids or roles permitted to use this channel; empty means public
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub status: ChannelStatus,
    /// Lower value wins; unset sorts after every explicit priority
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub tcp_host: Option<String>,
    #[serde(default)]
    pub tcp_port: Option<u16>,
    /// Trigger interval for polling channels, e.g. "30s" or "5m"
    #[serde(default)]
    pub polling_interval: Option<String>,
}

impl ChannelConfig {
    /// An enabled HTTP channel with no routes.
    pub fn http(name: impl Into<String>, url_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            url_pattern: url_pattern.into(),
            channel_type: ChannelType::Http,
            allow: Vec::new(),
            status: ChannelStatus::Enabled,
            priority: None,
            routes: Vec::new(),
            tcp_host: None,
            tcp_port: None,
            polling_interval: None,
        }
    }

    /// An enabled socket channel bound to `tcp_host:tcp_port`.
    pub fn socket(
        name: impl Into<String>,
        channel_type: ChannelType,
        tcp_host: impl Into<String>,
        tcp_port: u16,
    ) -> Self {
        Self {
            channel_type,
            tcp_host: Some(tcp_host.into()),
            tcp_port: Some(tcp_port),
            ..Self::http(name, "")
        }
    }

    pub fn with_route(mut self, route: RouteConfig) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_allow(mut self, allow: Vec<String>) -> Self {
        self.allow = allow;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    /// Routes that are enabled and flagged primary.
    pub fn enabled_primary_count(&self) -> usize {
        self.routes
            .iter()
            .filter(|r| r.primary && r.status == RouteStatus::Enabled)
            .count()
    }
}

/// One upstream target inside a channel.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub status: RouteStatus,
    /// Defaults to the channel's protocol family
    #[serde(default, rename = "type")]
    pub route_type: Option<RouteType>,
    /// Dial the upstream over TLS
    #[serde(default)]
    pub secured: bool,
    /// Name of an entry in `certificates`
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Literal path replacing the inbound path
    #[serde(default)]
    pub path: Option<String>,
    /// `s/<from>/<to>[/g]` substitution applied to the inbound path
    #[serde(default)]
    pub path_transform: Option<String>,
    #[serde(default)]
    pub forward_auth_header: bool,
    /// Overrides the router-wide timeout for this route
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl RouteConfig {
    /// An enabled, non-primary, plain route.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            primary: false,
            status: RouteStatus::Enabled,
            route_type: None,
            secured: false,
            cert: None,
            username: None,
            password: None,
            path: None,
            path_transform: None,
            forward_auth_header: false,
            timeout_secs: None,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.status = RouteStatus::Disabled;
        self
    }

    pub fn with_type(mut self, route_type: RouteType) -> Self {
        self.route_type = Some(route_type);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_path_transform(mut self, rule: impl Into<String>) -> Self {
        self.path_transform = Some(rule.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn secured_with(mut self, cert: Option<String>) -> Self {
        self.secured = true;
        self.cert = cert;
        self
    }
}
