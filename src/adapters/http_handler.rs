use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwap;
use axum::{
    body::Body as AxumBody,
    http::{HeaderValue, StatusCode, header},
};
use bytes::Bytes;
use eyre::{Result, WrapErr};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{Request, Response};
use tracing::Instrument;

use crate::{
    core::{
        GatewayError, GatewayService,
        request::{InboundRequest, RoutedResponse},
    },
    metrics,
    utils::ConnectionTracker,
};

/// Body returned for every failure the caller must not see the details of.
pub const INTERNAL_ERROR_BODY: &str = "Internal server error";

/// HTTP ingress handler.
///
/// Buffers the request body (bounded by `router.max_body_bytes`), resolves the caller, hands
/// the request to the current gateway snapshot and converts the dispatch outcome into the
/// response the caller sees.
pub struct HttpHandler {
    gateway: Arc<ArcSwap<GatewayService>>,
    connection_tracker: ConnectionTracker,
    secure: bool,
}

impl HttpHandler {
    pub fn new(
        gateway: Arc<ArcSwap<GatewayService>>,
        connection_tracker: ConnectionTracker,
    ) -> Self {
        Self {
            gateway,
            connection_tracker,
            secure: false,
        }
    }

    /// Mark requests handled here as received over TLS.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Main request handler.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, eyre::Error> {
        let span = tracing::info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            remote_addr = ?client_addr,
        );

        let ingress = if self.secure { "https" } else { "http" };
        let _connection = client_addr.map(|addr| self.connection_tracker.track(addr, ingress));

        self.route_request(req, client_addr).instrument(span).await
    }

    async fn route_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>> {
        // In-flight requests keep the snapshot they started with
        let gateway = self.gateway.load_full();
        let method = req.method().to_string();
        let _timer = metrics::RequestTimer::new(&method);

        let (parts, body) = req.into_parts();
        let limit = gateway.config().router.max_body_bytes;
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::warn!(limit, "Request body exceeds limit");
                metrics::increment_request_total("none", &method, 413);
                return plain_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read request body");
                metrics::increment_request_total("none", &method, 400);
                return plain_response(StatusCode::BAD_REQUEST, "Bad request");
            }
        };

        let caller = gateway.authenticate(&parts.headers, client_addr).await;
        let request = InboundRequest::http(
            parts.method,
            parts.uri.path(),
            parts.uri.query().map(str::to_string),
            parts.headers,
            body,
        )
        .with_remote_addr(client_addr)
        .secure(self.secure);

        match gateway.route_http(request, caller.as_ref()).await {
            Ok(dispatched) => {
                tracing::info!(
                    transaction_id = %dispatched.transaction_id,
                    channel = %dispatched.channel,
                    status = dispatched.response.status.as_u16(),
                    "Request dispatched"
                );
                metrics::increment_request_total(
                    &dispatched.channel,
                    &method,
                    dispatched.response.status.as_u16(),
                );
                caller_response(dispatched.response)
            }
            Err(e) => {
                let status = error_status(&e);
                match &e {
                    GatewayError::NotFound(_) | GatewayError::Forbidden(_) => {
                        tracing::info!(error = %e, status = status.as_u16(), "Request rejected")
                    }
                    _ => tracing::error!(error = %e, "Request failed"),
                }
                metrics::increment_request_total("none", &method, status.as_u16());
                plain_response(status, error_body(status))
            }
        }
    }
}

impl Clone for HttpHandler {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            connection_tracker: self.connection_tracker.clone(),
            secure: self.secure,
        }
    }
}

fn error_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(status: StatusCode) -> &'static str {
    match status {
        StatusCode::NOT_FOUND => "Not found",
        StatusCode::FORBIDDEN => "Forbidden",
        _ => INTERNAL_ERROR_BODY,
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Result<Response<AxumBody>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(AxumBody::from(body))
        .wrap_err("Failed to build error response")
}

/// The primary route's response as the caller sees it. Redirect-class responses carrying a
/// `Location` become redirects; the header passes through untouched on any other status.
fn caller_response(routed: RoutedResponse) -> Result<Response<AxumBody>> {
    let location = routed.redirect_location().map(str::to_string);
    let RoutedResponse {
        status,
        mut headers,
        body,
    } = routed;

    // The body is re-framed by the ingress connection
    headers.remove(header::CONTENT_LENGTH);

    let body = match location {
        Some(location) => {
            tracing::debug!(%location, status = status.as_u16(), "Redirecting caller");
            let value = HeaderValue::from_str(&location).wrap_err("Invalid redirect location")?;
            headers.insert(header::LOCATION, value);
            if body.is_empty() {
                Bytes::from(format!("Redirecting to {location}."))
            } else {
                body
            }
        }
        None => body,
    };

    let mut response = Response::builder()
        .status(status)
        .body(AxumBody::from(body))
        .wrap_err("Failed to build routed response")?;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;
    use crate::{
        adapters::{HttpClientAdapter, SocketClientAdapter, recorder::InMemoryRecorder},
        config::{ChannelConfig, RouteConfig, RouterConfig, ServerConfig},
        core::{MulticastDispatcher, SecondaryTasks},
    };

    fn handler(config: ServerConfig) -> HttpHandler {
        let dispatcher = MulticastDispatcher::new(
            Arc::new(HttpClientAdapter::new().unwrap()),
            Arc::new(SocketClientAdapter::new(1024).unwrap()),
            Arc::new(InMemoryRecorder::new()),
            SecondaryTasks::new(),
        );
        let gateway = GatewayService::new(Arc::new(config), dispatcher).unwrap();
        HttpHandler::new(
            Arc::new(ArcSwap::from_pointee(gateway)),
            ConnectionTracker::new(),
        )
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn request(path: &str, body: &'static str) -> Request<AxumBody> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(AxumBody::from(body))
            .unwrap()
    }

    async fn body_text(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404() {
        let port = closed_port().await;
        let handler = handler(
            ServerConfig::builder()
                .listen_addr("127.0.0.1:0")
                .channel(
                    ChannelConfig::http("lab", "^/lab")
                        .with_route(RouteConfig::new("lis", "127.0.0.1", port).primary()),
                )
                .build()
                .unwrap(),
        );

        let response = handler.handle_request(request("/other", ""), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_restricted_channel_is_403_for_anonymous() {
        let port = closed_port().await;
        let handler = handler(
            ServerConfig::builder()
                .listen_addr("127.0.0.1:0")
                .channel(
                    ChannelConfig::http("lab", "^/lab")
                        .with_allow(vec!["lab".into()])
                        .with_route(RouteConfig::new("lis", "127.0.0.1", port).primary()),
                )
                .build()
                .unwrap(),
        );

        let response = handler.handle_request(request("/lab", ""), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_primary_failure_hides_detail() {
        let port = closed_port().await;
        let handler = handler(
            ServerConfig::builder()
                .listen_addr("127.0.0.1:0")
                .channel(
                    ChannelConfig::http("lab", "^/lab")
                        .with_route(RouteConfig::new("lis", "127.0.0.1", port).primary()),
                )
                .build()
                .unwrap(),
        );

        let response = handler.handle_request(request("/lab", "x"), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, INTERNAL_ERROR_BODY);
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let port = closed_port().await;
        let handler = handler(
            ServerConfig::builder()
                .listen_addr("127.0.0.1:0")
                .router(RouterConfig {
                    max_body_bytes: 4,
                    ..RouterConfig::default()
                })
                .channel(
                    ChannelConfig::http("lab", "^/lab")
                        .with_route(RouteConfig::new("lis", "127.0.0.1", port).primary()),
                )
                .build()
                .unwrap(),
        );

        let response = handler
            .handle_request(request("/lab", "too large"), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_redirect_gets_default_body() {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/moved"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("99"));

        let response = caller_response(RoutedResponse {
            status: StatusCode::MOVED_PERMANENTLY,
            headers,
            body: Bytes::new(),
        })
        .unwrap();

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/moved");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(body_text(response).await, "Redirecting to /moved.");
    }

    #[tokio::test]
    async fn test_created_with_location_is_not_a_redirect() {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/Patient/1"));

        let response = caller_response(RoutedResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"{}"),
        })
        .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_text(response).await, "{}");
    }
}
