//! Channel selection for inbound requests.
//!
//! Every enabled channel is evaluated before a winner is picked: the candidate with the lowest
//! `priority` wins and configuration order breaks ties. URL patterns match anywhere in the
//! path (unanchored, case-sensitive); a channel wanting a full-path match anchors its pattern.
use std::sync::Arc;

use thiserror::Error;

use crate::{
    config::ChannelType,
    core::channel::{CallerIdentity, Channel, ChannelRegistry},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MatchError {
    /// No enabled channel matches the request
    #[error("no channel matches {0}")]
    NotFound(String),

    /// Channels match the request but none admits the caller
    #[error("caller is not permitted on any channel matching {0}")]
    Forbidden(String),
}

/// Inbound protocol as seen by the listener that accepted the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressProtocol {
    Http,
    Tcp,
    Tls,
}

impl IngressProtocol {
    /// Whether a channel of type `kind` may serve requests arriving over this protocol.
    pub fn accepts(self, kind: ChannelType) -> bool {
        matches!(
            (self, kind),
            (IngressProtocol::Http, ChannelType::Http)
                | (IngressProtocol::Tcp, ChannelType::Tcp)
                | (IngressProtocol::Tls, ChannelType::Tls)
        )
    }
}

/// Resolves requests to channels against one registry snapshot.
pub struct ChannelMatcher<'a> {
    registry: &'a ChannelRegistry,
}

impl<'a> ChannelMatcher<'a> {
    pub fn new(registry: &'a ChannelRegistry) -> Self {
        Self { registry }
    }

    /// Select the channel serving `path` for `caller` over `protocol`.
    pub fn match_path(
        &self,
        path: &str,
        protocol: IngressProtocol,
        caller: Option<&CallerIdentity>,
    ) -> Result<Arc<Channel>, MatchError> {
        let mut denied = false;

        let best = self
            .registry
            .channels()
            .iter()
            .filter(|channel| channel.is_enabled() && protocol.accepts(channel.kind))
            .filter(|channel| channel.url_pattern.is_match(path))
            .filter(|channel| {
                let admitted = channel.admits(caller);
                denied |= !admitted;
                admitted
            })
            .min_by_key(|channel| channel.precedence())
            .cloned();

        match best {
            Some(channel) => {
                tracing::debug!(channel = %channel.name, path, "Matched channel");
                Ok(channel)
            }
            None if denied => Err(MatchError::Forbidden(path.to_string())),
            None => Err(MatchError::NotFound(path.to_string())),
        }
    }

    /// Select the socket channel bound to `host:port`. Path patterns play no part here.
    pub fn match_socket(
        &self,
        host: &str,
        port: u16,
        protocol: IngressProtocol,
    ) -> Result<Arc<Channel>, MatchError> {
        self.registry
            .channels()
            .iter()
            .filter(|channel| channel.is_enabled() && protocol.accepts(channel.kind))
            .filter(|channel| {
                channel.tcp_port == Some(port) && channel.tcp_host.as_deref() == Some(host)
            })
            .min_by_key(|channel| channel.precedence())
            .cloned()
            .ok_or_else(|| MatchError::NotFound(format!("{host}:{port}")))
    }
}
