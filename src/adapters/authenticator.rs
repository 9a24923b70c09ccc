use std::{collections::HashMap, net::SocketAddr};

use async_trait::async_trait;
use http::{HeaderMap, HeaderName};

use crate::{
    config::ServerConfig,
    core::channel::CallerIdentity,
    ports::authenticator::Authenticator,
};

/// Trusts an identity header set by the authenticating front proxy.
///
/// Only client ids listed under `clients` resolve; anything else is anonymous.
#[derive(Debug, Clone)]
pub struct HeaderAuthenticator {
    header: HeaderName,
    clients: HashMap<String, Vec<String>>,
}

impl HeaderAuthenticator {
    pub fn from_config(config: &ServerConfig) -> eyre::Result<Self> {
        let name = &config.auth.identity_header;
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| eyre::eyre!("invalid identity header '{name}': {e}"))?;

        let clients = config
            .clients
            .iter()
            .map(|client| (client.client_id.clone(), client.roles.clone()))
            .collect();

        Ok(Self { header, clients })
    }
}

#[async_trait]
impl Authenticator for HeaderAuthenticator {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
    ) -> Option<CallerIdentity> {
        let client_id = headers.get(&self.header)?.to_str().ok()?.trim();

        match self.clients.get(client_id) {
            Some(roles) => Some(CallerIdentity::new(client_id, roles.clone())),
            None => {
                tracing::debug!(
                    client_id,
                    remote_addr = ?remote_addr,
                    "Unknown client id, treating caller as anonymous"
                );
                None
            }
        }
    }
}
