//! Core switch orchestration service.
//!
//! The `GatewayService` pairs one immutable configuration snapshot with the channel registry
//! compiled from it and the multicast dispatcher. It provides:
//! * HTTP dispatch: match by path, caller and protocol, then multicast
//! * Socket dispatch: match by bound `tcp_host:tcp_port`, then multicast
//! * Polling triggers for `polling` channels
//!
//! A reload builds a new `GatewayService`; requests already in flight keep the one they
//! started with.
use std::sync::Arc;

use thiserror::Error;

use crate::{
    config::{ChannelType, ServerConfig},
    core::{
        channel::{CallerIdentity, Channel, ChannelError, ChannelRegistry},
        dispatcher::{DispatchError, DispatchResult, MulticastDispatcher},
        matcher::{ChannelMatcher, IngressProtocol, MatchError},
        request::InboundRequest,
    },
    ports::authenticator::Authenticator,
};

/// Path dispatched when a polling channel fires.
pub const POLLING_TRIGGER_PATH: &str = "/trigger";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("no channel found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<MatchError> for GatewayError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::NotFound(target) => GatewayError::NotFound(target),
            MatchError::Forbidden(target) => GatewayError::Forbidden(target),
        }
    }
}

impl From<ChannelError> for GatewayError {
    fn from(err: ChannelError) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

/// Central orchestrator for channel matching and dispatch. Cheap to share behind an `Arc`.
pub struct GatewayService {
    config: Arc<ServerConfig>,
    registry: ChannelRegistry,
    dispatcher: MulticastDispatcher,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl GatewayService {
    /// Compile `config` into a registry. Fails if a pattern or path rewrite does not parse.
    pub fn new(
        config: Arc<ServerConfig>,
        dispatcher: MulticastDispatcher,
    ) -> Result<Self, GatewayError> {
        let registry = ChannelRegistry::from_config(&config)?;
        tracing::debug!(channels = registry.len(), "Compiled channel registry");

        Ok(Self {
            config,
            registry,
            dispatcher,
            authenticator: None,
        })
    }

    /// Resolve callers with `authenticator`; without one every caller is anonymous.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &MulticastDispatcher {
        &self.dispatcher
    }

    pub async fn authenticate(
        &self,
        headers: &http::HeaderMap,
        remote_addr: Option<std::net::SocketAddr>,
    ) -> Option<CallerIdentity> {
        match &self.authenticator {
            Some(authenticator) => authenticator.authenticate(headers, remote_addr).await,
            None => None,
        }
    }

    /// Route an HTTP request received on the ingress listener.
    pub async fn route_http(
        &self,
        request: InboundRequest,
        caller: Option<&CallerIdentity>,
    ) -> Result<DispatchResult, GatewayError> {
        let channel = ChannelMatcher::new(&self.registry).match_path(
            &request.path,
            IngressProtocol::Http,
            caller,
        )?;

        Ok(self.dispatcher.dispatch(channel, request).await?)
    }

    /// Channel bound to the socket listener at `host:port`.
    pub fn match_socket(
        &self,
        host: &str,
        port: u16,
        protocol: IngressProtocol,
    ) -> Result<Arc<Channel>, GatewayError> {
        Ok(ChannelMatcher::new(&self.registry).match_socket(host, port, protocol)?)
    }

    /// Multicast `request` over an already matched channel.
    pub async fn dispatch(
        &self,
        channel: Arc<Channel>,
        request: InboundRequest,
    ) -> Result<DispatchResult, GatewayError> {
        Ok(self.dispatcher.dispatch(channel, request).await?)
    }

    /// Fire the polling channel `name` once.
    pub async fn trigger_polling(&self, name: &str) -> Result<DispatchResult, GatewayError> {
        let channel = self
            .registry
            .get(name)
            .filter(|c| c.is_enabled() && c.kind == ChannelType::Polling)
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;

        let request = InboundRequest::http(
            http::Method::GET,
            POLLING_TRIGGER_PATH,
            None,
            http::HeaderMap::new(),
            bytes::Bytes::new(),
        );
        Ok(self.dispatcher.dispatch(channel, request).await?)
    }
}
