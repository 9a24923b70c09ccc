//! Inbound requests, caller-visible responses and the per-route forwarding policy.
use std::net::SocketAddr;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use uuid::Uuid;

use crate::{
    core::{
        channel::Route,
        mediator::MediatorHttpResponse,
        transaction::{RequestSnapshot, ResponseSnapshot, header_snapshot},
    },
    ports::http_client::OutboundRequest,
};

/// Header carrying the transaction id to every HTTP route.
pub const TRANSACTION_ID_HEADER: &str = "x-interlink-transaction-id";

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in connection_listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// A request as received by a listener, fully buffered.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
    /// Arrived over TLS
    pub secure: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundRequest {
    pub fn http(
        method: Method,
        path: impl Into<String>,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            query,
            headers,
            body,
            remote_addr: None,
            secure: false,
            received_at: Utc::now(),
        }
    }

    /// A raw socket payload. HTTP routes on socket channels receive it as `POST /`.
    pub fn socket(payload: Bytes, remote_addr: Option<SocketAddr>, secure: bool) -> Self {
        Self {
            remote_addr,
            secure,
            ..Self::http(Method::POST, "/", None, HeaderMap::new(), payload)
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: Option<SocketAddr>) -> Self {
        self.remote_addr = remote_addr;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    fn host_header(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        let host = self.host_header().map(|h| h.to_string());
        RequestSnapshot {
            host,
            port: None,
            method: self.method.to_string(),
            path: self.path.clone(),
            querystring: self.query.clone(),
            headers: header_snapshot(&self.headers),
            body: self.body.clone(),
            timestamp: self.received_at,
        }
    }
}

/// The response handed back to the original caller.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RoutedResponse {
    /// A socket route's reply.
    pub fn raw(body: Bytes) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// The response declared inside a mediator envelope.
    pub fn from_mediator(response: &MediatorHttpResponse) -> Self {
        Self {
            status: response.status_code().unwrap_or(StatusCode::OK),
            headers: response.header_map(),
            body: Bytes::from(response.body.clone().unwrap_or_default()),
        }
    }

    /// `Location` of a redirect-class response. Other statuses never redirect, even when they
    /// carry the header.
    pub fn redirect_location(&self) -> Option<&str> {
        if !self.status.is_redirection() {
            return None;
        }
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
    }

    pub fn snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            status: self.status.as_u16(),
            headers: header_snapshot(&self.headers),
            body: self.body.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Headers sent to `route` for `inbound`.
///
/// Hop-by-hop headers and `Host` are dropped. The inbound `Authorization` header only passes
/// when the route opts in; route credentials always replace it.
pub fn outbound_headers(
    route: &Route,
    inbound: &InboundRequest,
    transaction_id: Uuid,
) -> HeaderMap {
    let mut headers = inbound.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    if !route.forward_auth_header {
        headers.remove(header::AUTHORIZATION);
    }
    if let Some(credentials) = &route.credentials {
        let token = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
        match HeaderValue::from_str(&format!("Basic {token}")) {
            Ok(value) => {
                headers.insert(header::AUTHORIZATION, value);
            }
            Err(e) => tracing::warn!(route = %route.name, error = %e, "Unusable route credentials"),
        }
    }

    if let Some(addr) = inbound.remote_addr {
        let ip = addr.ip().to_string();
        let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
    }
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if inbound.secure { "https" } else { "http" }),
    );
    if let Some(host) = inbound.headers.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&transaction_id.to_string()) {
        headers.insert(TRANSACTION_ID_HEADER, value);
    }

    headers
}

/// Build the request forwarded to an HTTP route: rewritten path, policy-filtered headers,
/// method, query and body unchanged.
pub fn outbound_request(
    route: &Route,
    inbound: &InboundRequest,
    transaction_id: Uuid,
) -> OutboundRequest {
    let mut path = route.rewrite.apply(&inbound.path);
    if !path.starts_with('/') {
        path.insert(0, '/');
    }

    OutboundRequest {
        method: inbound.method.clone(),
        path,
        query: inbound.query.clone(),
        headers: outbound_headers(route, inbound, transaction_id),
        body: inbound.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ChannelConfig, RouteConfig, RouterConfig},
        core::channel::Channel,
    };

    fn route(config: RouteConfig) -> Route {
        let channel = ChannelConfig::http("c", "/").with_route(config.primary());
        Channel::compile(0, &channel, &RouterConfig::default())
            .unwrap()
            .routes
            .remove(0)
    }

    fn inbound() -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
        headers.insert(header::HOST, HeaderValue::from_static("switch.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("x-keep", HeaderValue::from_static("yes"));
        InboundRequest::http(
            Method::POST,
            "/fhir/Patient",
            Some("_id=1".into()),
            headers,
            Bytes::from_static(b"{}"),
        )
        .with_remote_addr(Some("10.0.0.7:5555".parse().unwrap()))
    }

    #[test]
    fn test_authorization_stripped_by_default() {
        let headers =
            outbound_headers(&route(RouteConfig::new("r", "h", 1)), &inbound(), Uuid::nil());
        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get("x-trace").is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert_eq!(headers["x-keep"], "yes");
        assert_eq!(headers["x-forwarded-for"], "10.0.0.7");
        assert_eq!(headers["x-forwarded-host"], "switch.local");
        assert_eq!(headers["x-forwarded-proto"], "http");
        assert_eq!(headers[TRANSACTION_ID_HEADER], Uuid::nil().to_string().as_str());
    }

    #[test]
    fn test_authorization_forwarded_when_enabled() {
        let mut config = RouteConfig::new("r", "h", 1);
        config.forward_auth_header = true;
        let headers = outbound_headers(&route(config), &inbound(), Uuid::nil());
        assert_eq!(headers[header::AUTHORIZATION], "Bearer caller");
    }

    #[test]
    fn test_route_credentials_win() {
        let mut config = RouteConfig::new("r", "h", 1).with_credentials("user", "pass");
        config.forward_auth_header = true;
        let headers = outbound_headers(&route(config), &inbound(), Uuid::nil());
        assert_eq!(headers[header::AUTHORIZATION], "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_outbound_request_rewrites_path() {
        let request = outbound_request(
            &route(RouteConfig::new("r", "h", 1).with_path_transform("s/fhir/baseR4")),
            &inbound(),
            Uuid::nil(),
        );
        assert_eq!(request.path_and_query(), "/baseR4/Patient?_id=1");
        assert_eq!(request.method, Method::POST);

        let emptied = outbound_request(
            &route(RouteConfig::new("r", "h", 1).with_path_transform("s/\\/fhir\\/Patient/")),
            &inbound(),
            Uuid::nil(),
        );
        assert_eq!(emptied.path, "/");
    }

    #[test]
    fn test_redirect_only_for_3xx() {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/elsewhere"));

        let moved = RoutedResponse {
            status: StatusCode::MOVED_PERMANENTLY,
            headers: headers.clone(),
            body: Bytes::new(),
        };
        assert_eq!(moved.redirect_location(), Some("/elsewhere"));

        let created = RoutedResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::new(),
        };
        assert_eq!(created.redirect_location(), None);
    }
}
