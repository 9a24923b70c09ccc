use std::{collections::HashMap, error::Error as StdError};

use async_trait::async_trait;
use bytes::Bytes;
use eyre::{Result, WrapErr};
use http_body_util::{BodyExt, Full};
use hyper::{Request, Uri, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio::time::timeout;

use crate::{
    adapters::tls,
    config::CertificateConfig,
    core::{channel::Route, request::strip_hop_by_hop},
    ports::http_client::{
        HttpClient, HttpClientError, HttpClientResult, OutboundRequest, UpstreamResponse,
    },
};

type RouteClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// HTTP route adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Dials `http://` or, for secured routes, `https://` using the route's TLS profile
/// * Sets `Host` to the route authority and forces HTTP/1.1
/// * Applies the route timeout to the whole exchange, body included
/// * Buffers the upstream body so it can be recorded and inspected for mediator envelopes
///
/// Idle connections are never reused; every forward opens a fresh connection.
pub struct HttpClientAdapter {
    default_client: RouteClient,
    profiles: HashMap<String, RouteClient>,
}

impl HttpClientAdapter {
    /// Create an adapter trusting only the platform roots.
    pub fn new() -> Result<Self> {
        Self::with_certificates(&HashMap::new())
    }

    /// Create an adapter with one TLS client per named certificate profile.
    pub fn with_certificates(certificates: &HashMap<String, CertificateConfig>) -> Result<Self> {
        let default_client = Self::build_client(tls::client_config(None)?);

        let mut profiles = HashMap::new();
        for (name, profile) in certificates {
            let tls_config = tls::client_config(Some(profile))
                .wrap_err_with(|| format!("certificate profile '{name}'"))?;
            profiles.insert(name.clone(), Self::build_client(tls_config));
        }

        tracing::info!(
            profiles = profiles.len(),
            "Created HTTP route client"
        );
        Ok(Self {
            default_client,
            profiles,
        })
    }

    fn build_client(tls_config: rustls::ClientConfig) -> RouteClient {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(https_connector)
    }

    fn client_for(&self, route: &Route) -> HttpClientResult<&RouteClient> {
        match (&route.cert, route.secured) {
            (Some(name), true) => self
                .profiles
                .get(name)
                .ok_or_else(|| HttpClientError::UnknownCertificate(name.clone())),
            _ => Ok(&self.default_client),
        }
    }

    fn build_request(
        route: &Route,
        request: OutboundRequest,
    ) -> HttpClientResult<Request<Full<Bytes>>> {
        let scheme = if route.secured { "https" } else { "http" };
        let uri: Uri = format!(
            "{scheme}://{}{}",
            route.authority(),
            request.path_and_query()
        )
        .parse()
        .map_err(|e| HttpClientError::InvalidRequest(format!("{e}")))?;

        let host = HeaderValue::from_str(&route.authority())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let mut outgoing = Request::builder()
            .method(request.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(Full::new(request.body))
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        *outgoing.headers_mut() = request.headers;
        outgoing.headers_mut().insert(header::HOST, host);
        Ok(outgoing)
    }
}

/// Whether a rustls error sits anywhere in the error chain.
fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io
                .get_ref()
                .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some())
        {
            return true;
        }
        current = e.source();
    }
    false
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn forward(
        &self,
        route: &Route,
        request: OutboundRequest,
    ) -> HttpClientResult<UpstreamResponse> {
        let client = self.client_for(route)?.clone();
        let outgoing = Self::build_request(route, request)?;

        tracing::debug!(
            "Sending request: {} {}",
            outgoing.method(),
            outgoing.uri()
        );
        tracing::trace!("Outgoing request headers: {:?}", outgoing.headers());

        let exchange = async {
            let response = client.request(outgoing).await.map_err(|e| {
                if is_tls_failure(&e) {
                    HttpClientError::TlsError(e.to_string())
                } else {
                    HttpClientError::ConnectionError(format!("{e:?}"))
                }
            })?;

            let (mut parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| HttpClientError::BodyError(e.to_string()))?
                .to_bytes();

            // The body is buffered; the ingress recomputes framing
            parts.headers.remove(header::TRANSFER_ENCODING);
            strip_hop_by_hop(&mut parts.headers);

            Ok::<_, HttpClientError>(UpstreamResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        match timeout(route.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(HttpClientError::Timeout(route.timeout.as_millis())),
        }
    }
}
