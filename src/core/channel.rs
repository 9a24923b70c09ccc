//! Compiled, immutable channel and route descriptors.
//!
//! A [`ChannelRegistry`] is built once per configuration load: URL patterns are compiled to
//! [`Regex`], path rewrites are parsed, timeouts resolved. Dispatch only ever reads a registry
//! snapshot, so a reload never becomes visible half way through a request.
use std::{collections::HashSet, sync::Arc, time::Duration};

use regex::Regex;
use thiserror::Error;

use crate::{
    config::{
        ChannelConfig, ChannelStatus, ChannelType, RouteConfig, RouteStatus, RouteType,
        RouterConfig, ServerConfig,
    },
    core::path_transform::{PathRewrite, PathTransformError},
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("channel '{channel}' has an invalid url pattern: {source}")]
    InvalidPattern {
        channel: String,
        #[source]
        source: regex::Error,
    },

    #[error("route '{route}' of channel '{channel}': {source}")]
    InvalidPathRewrite {
        channel: String,
        route: String,
        #[source]
        source: PathTransformError,
    },

    #[error("channel '{channel}' has an invalid polling interval '{value}': {reason}")]
    InvalidPollingInterval {
        channel: String,
        value: String,
        reason: String,
    },
}

/// Parse a `polling_interval` such as `"30s"` or `"5m"`. Zero is rejected.
pub fn parse_interval(value: &str) -> Result<Duration, String> {
    let duration = humantime::parse_duration(value.trim()).map_err(|e| e.to_string())?;
    if duration.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(duration)
}

/// Identity of an authenticated caller, as supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub identifier: String,
    pub roles: Vec<String>,
}

impl CallerIdentity {
    pub fn new(identifier: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            identifier: identifier.into(),
            roles,
        }
    }
}

/// Route-level basic auth credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub primary: bool,
    pub enabled: bool,
    pub kind: RouteType,
    pub secured: bool,
    /// Name of the TLS profile to dial with
    pub cert: Option<String>,
    pub credentials: Option<Credentials>,
    pub rewrite: PathRewrite,
    pub forward_auth_header: bool,
    pub timeout: Duration,
}

impl Route {
    fn compile(
        channel: &ChannelConfig,
        config: &RouteConfig,
        default_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let rewrite =
            PathRewrite::from_route(config.path.as_deref(), config.path_transform.as_deref())
                .map_err(|source| ChannelError::InvalidPathRewrite {
                    channel: channel.name.clone(),
                    route: config.name.clone(),
                    source,
                })?;

        let credentials = match (&config.username, &config.password) {
            (Some(username), password) => Some(Credentials {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            primary: config.primary,
            enabled: config.status == RouteStatus::Enabled,
            kind: config
                .route_type
                .unwrap_or_else(|| RouteType::inherited_from(channel.channel_type)),
            secured: config.secured,
            cert: config.cert.clone(),
            credentials,
            rewrite,
            forward_auth_header: config.forward_auth_header,
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        })
    }

    /// `host:port` of the upstream, as used in logs and the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    /// Position in the configuration; breaks priority ties
    pub order: usize,
    pub name: String,
    pub url_pattern: Regex,
    pub kind: ChannelType,
    pub allow: HashSet<String>,
    pub status: ChannelStatus,
    pub priority: Option<u32>,
    pub routes: Vec<Route>,
    pub tcp_host: Option<String>,
    pub tcp_port: Option<u16>,
    pub polling_interval: Option<Duration>,
}

impl Channel {
    pub fn compile(
        order: usize,
        config: &ChannelConfig,
        router: &RouterConfig,
    ) -> Result<Self, ChannelError> {
        let url_pattern =
            Regex::new(&config.url_pattern).map_err(|source| ChannelError::InvalidPattern {
                channel: config.name.clone(),
                source,
            })?;

        let polling_interval = config
            .polling_interval
            .as_deref()
            .map(|value| {
                parse_interval(value).map_err(|reason| ChannelError::InvalidPollingInterval {
                    channel: config.name.clone(),
                    value: value.to_string(),
                    reason,
                })
            })
            .transpose()?;

        let default_timeout = Duration::from_secs(match config.channel_type {
            ChannelType::Http | ChannelType::Polling => router.http_timeout_secs,
            ChannelType::Tcp | ChannelType::Tls => router.socket_timeout_secs,
        });

        let routes = config
            .routes
            .iter()
            .map(|route| Route::compile(config, route, default_timeout))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            order,
            name: config.name.clone(),
            url_pattern,
            kind: config.channel_type,
            allow: config.allow.iter().cloned().collect(),
            status: config.status,
            priority: config.priority,
            routes,
            tcp_host: config.tcp_host.clone(),
            tcp_port: config.tcp_port,
            polling_interval,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    /// Whether `caller` may use this channel. Public channels (empty `allow`) admit everyone,
    /// anonymous callers only reach public channels.
    pub fn admits(&self, caller: Option<&CallerIdentity>) -> bool {
        if self.allow.is_empty() {
            return true;
        }
        caller.is_some_and(|identity| {
            self.allow.contains(&identity.identifier)
                || identity.roles.iter().any(|role| self.allow.contains(role))
        })
    }

    pub fn enabled_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(|r| r.enabled)
    }

    /// Sort key: explicit priority first (ascending), then configuration order.
    pub fn precedence(&self) -> (u32, usize) {
        (self.priority.unwrap_or(u32::MAX), self.order)
    }
}

/// All channels of one configuration snapshot, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Arc<Channel>>,
}

impl ChannelRegistry {
    pub fn from_config(config: &ServerConfig) -> Result<Self, ChannelError> {
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(order, channel)| Channel::compile(order, channel, &config.router).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { channels })
    }

    pub fn from_channels(channels: Vec<Channel>) -> Self {
        Self {
            channels: channels.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.iter().find(|c| c.name == name).cloned()
    }

    /// Enabled channels of the given type.
    pub fn enabled_of_kind(&self, kind: ChannelType) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels
            .iter()
            .filter(move |c| c.is_enabled() && c.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
