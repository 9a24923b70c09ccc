use std::net::SocketAddr;

use async_trait::async_trait;
use http::HeaderMap;

use crate::core::channel::CallerIdentity;

/// Authentication collaborator.
///
/// Resolves the caller behind an inbound HTTP request. `None` means anonymous; such callers
/// only reach channels with an empty allow list.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
    ) -> Option<CallerIdentity>;
}
