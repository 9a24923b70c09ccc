//! Multicast dispatch of one inbound request to every enabled route of a channel.
//!
//! Every route runs on [`SecondaryTasks`], the primary included, so a caller that goes away
//! mid-dispatch cannot prevent the transaction from being recorded. The caller awaits only the
//! primary and its response is the only one the caller sees. Secondary outcomes are reported to
//! the recorder after the transaction itself has been recorded, whenever they finish. A slow or
//! failing secondary never delays or alters the primary response.
use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::RouteType,
    core::{
        channel::{Channel, Route},
        mediator::{UpstreamBody, classify},
        request::{InboundRequest, RoutedResponse, outbound_request},
        transaction::{
            RequestSnapshot, RouteOutcome, TransactionOutcome, TransactionStatus, header_snapshot,
        },
    },
    ports::{
        http_client::HttpClient, socket_client::SocketClient,
        transaction_recorder::TransactionRecorder,
    },
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("channel '{0}' has no enabled primary route")]
    NoPrimaryRoute(String),

    #[error("channel '{channel}' has {count} enabled primary routes")]
    MultiplePrimaryRoutes { channel: String, count: usize },

    #[error("primary route '{route}' of channel '{channel}' failed: {reason}")]
    PrimaryRouteFailed {
        channel: String,
        route: String,
        reason: String,
        transaction_id: Uuid,
    },
}

impl DispatchError {
    /// Misconfiguration rather than an upstream failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DispatchError::NoPrimaryRoute(_) | DispatchError::MultiplePrimaryRoutes { .. }
        )
    }
}

/// Result of a dispatch whose primary route answered.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub transaction_id: Uuid,
    pub channel: String,
    pub response: RoutedResponse,
    pub status: TransactionStatus,
}

/// Tracks route tasks that may outlive the caller so shutdown can wait for them.
#[derive(Debug, Clone, Default)]
pub struct SecondaryTasks {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SecondaryTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Spawn a tracked task whose result the caller awaits.
    pub fn spawn_joined<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `grace` for in-flight secondaries, then cancel the rest.
    ///
    /// Returns `true` when everything finished within the grace period.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }

        tracing::warn!(
            in_flight = self.tracker.len(),
            "Secondary routes still running after {:?}, cancelling",
            grace
        );
        self.cancel.cancel();
        self.tracker.wait().await;
        false
    }
}

/// One route attempt: the recorded outcome plus, on success, the effective response.
struct RouteAttempt {
    outcome: RouteOutcome,
    response: Result<RoutedResponse, String>,
}

#[derive(Clone)]
pub struct MulticastDispatcher {
    http_client: Arc<dyn HttpClient>,
    socket_client: Arc<dyn SocketClient>,
    recorder: Arc<dyn TransactionRecorder>,
    tasks: SecondaryTasks,
}

impl MulticastDispatcher {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        socket_client: Arc<dyn SocketClient>,
        recorder: Arc<dyn TransactionRecorder>,
        tasks: SecondaryTasks,
    ) -> Self {
        Self {
            http_client,
            socket_client,
            recorder,
            tasks,
        }
    }

    pub fn tasks(&self) -> &SecondaryTasks {
        &self.tasks
    }

    /// The single enabled primary route of `channel`.
    pub fn primary_route(channel: &Channel) -> Result<&Route, DispatchError> {
        let mut primaries = channel.enabled_routes().filter(|r| r.primary);
        let primary = primaries
            .next()
            .ok_or_else(|| DispatchError::NoPrimaryRoute(channel.name.clone()))?;

        let extra = primaries.count();
        if extra > 0 {
            return Err(DispatchError::MultiplePrimaryRoutes {
                channel: channel.name.clone(),
                count: extra + 1,
            });
        }
        Ok(primary)
    }

    /// Forward `request` to every enabled route of `channel` and return the primary's response.
    pub async fn dispatch(
        &self,
        channel: Arc<Channel>,
        request: InboundRequest,
    ) -> Result<DispatchResult, DispatchError> {
        let primary = Self::primary_route(&channel)?.clone();
        let transaction_id = Uuid::new_v4();

        let span = tracing::info_span!(
            "channel_dispatch",
            channel = %channel.name,
            transaction_id = %transaction_id,
            routes = channel.enabled_routes().count(),
            status = tracing::field::Empty,
        );

        let request = Arc::new(request);

        async {
            let (recorded_tx, recorded_rx) = watch::channel(false);

            for route in channel.enabled_routes().filter(|r| !r.primary) {
                self.spawn_secondary(
                    channel.name.clone(),
                    route.clone(),
                    Arc::clone(&request),
                    transaction_id,
                    recorded_rx.clone(),
                );
            }
            drop(recorded_rx);

            let this = self.clone();
            let (channel_name, route_name) = (channel.name.clone(), primary.name.clone());
            let completion = self.tasks.spawn_joined(
                async move {
                    this.complete_primary(channel, primary, request, transaction_id, recorded_tx)
                        .await
                }
                .in_current_span(),
            );

            completion.await.unwrap_or_else(|e| {
                Err(DispatchError::PrimaryRouteFailed {
                    channel: channel_name,
                    route: route_name,
                    reason: e.to_string(),
                    transaction_id,
                })
            })
        }
        .instrument(span)
        .await
    }

    /// Run the primary route and record the transaction, then release the secondaries.
    async fn complete_primary(
        &self,
        channel: Arc<Channel>,
        primary: Route,
        request: Arc<InboundRequest>,
        transaction_id: Uuid,
        recorded: watch::Sender<bool>,
    ) -> Result<DispatchResult, DispatchError> {
        let attempt = self
            .run_route(&channel.name, &primary, &request, transaction_id)
            .await;

        let transaction = TransactionOutcome::new(
            transaction_id,
            channel.name.clone(),
            request.snapshot(),
            attempt.outcome,
        );
        let status = transaction.status;
        tracing::Span::current().record("status", tracing::field::display(status));

        if let Err(e) = self.recorder.record_transaction(&transaction).await {
            tracing::error!(error = %e, "Failed to record transaction");
        }
        let _ = recorded.send(true);
        crate::metrics::record_transaction(&channel.name, status);

        match attempt.response {
            Ok(response) => Ok(DispatchResult {
                transaction_id,
                channel: channel.name.clone(),
                response,
                status,
            }),
            Err(reason) => Err(DispatchError::PrimaryRouteFailed {
                channel: channel.name.clone(),
                route: primary.name,
                reason,
                transaction_id,
            }),
        }
    }

    fn spawn_secondary(
        &self,
        channel: String,
        route: Route,
        request: Arc<InboundRequest>,
        transaction_id: Uuid,
        mut recorded: watch::Receiver<bool>,
    ) {
        let this = self.clone();
        let cancel = self.tasks.cancellation();

        let task = async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                attempt = this.run_route(&channel, &route, &request, transaction_id) => {
                    attempt.outcome
                }
                _ = cancel.cancelled() => RouteOutcome::failed(
                    route.name.clone(),
                    false,
                    request.snapshot(),
                    "cancelled during shutdown",
                    started.elapsed(),
                ),
            };

            // Closed only if the primary task panicked; record anyway.
            let _ = recorded.wait_for(|done| *done).await;

            if let Err(e) = this.recorder.record_route(transaction_id, &outcome).await {
                tracing::warn!(route = %route.name, error = %e, "Failed to record secondary route");
            }
        };

        self.tasks.spawn(task.in_current_span());
    }

    async fn run_route(
        &self,
        channel: &str,
        route: &Route,
        request: &InboundRequest,
        transaction_id: Uuid,
    ) -> RouteAttempt {
        let span = tracing::info_span!(
            "route",
            route = %route.name,
            primary = route.primary,
            kind = %route.kind,
            upstream = %route.authority(),
            http.status_code = tracing::field::Empty,
        );

        async {
            let started = Instant::now();

            let (snapshot, result) = match route.kind {
                RouteType::Http => {
                    let outbound = outbound_request(route, request, transaction_id);
                    let snapshot = RequestSnapshot {
                        host: Some(route.host.clone()),
                        port: Some(route.port),
                        method: outbound.method.to_string(),
                        path: outbound.path.clone(),
                        querystring: outbound.query.clone(),
                        headers: header_snapshot(&outbound.headers),
                        body: outbound.body.clone(),
                        timestamp: Utc::now(),
                    };
                    let result = self
                        .http_client
                        .forward(route, outbound)
                        .await
                        .map(|upstream| {
                            match classify(&upstream.headers, upstream.body.clone()) {
                                UpstreamBody::Mediator(envelope) => (
                                    RoutedResponse::from_mediator(&envelope.response),
                                    Some(envelope),
                                ),
                                UpstreamBody::Raw(body) => (
                                    RoutedResponse {
                                        status: upstream.status,
                                        headers: upstream.headers,
                                        body,
                                    },
                                    None,
                                ),
                            }
                        })
                        .map_err(|e| e.to_string());
                    (snapshot, result)
                }
                RouteType::Tcp | RouteType::Mllp => {
                    let snapshot = RequestSnapshot {
                        host: Some(route.host.clone()),
                        port: Some(route.port),
                        method: String::new(),
                        path: String::new(),
                        querystring: None,
                        headers: Default::default(),
                        body: request.body.clone(),
                        timestamp: Utc::now(),
                    };
                    let result = self
                        .socket_client
                        .forward(route, request.body.clone())
                        .await
                        .map(|body| (RoutedResponse::raw(body), None))
                        .map_err(|e| e.to_string());
                    (snapshot, result)
                }
            };

            let duration = started.elapsed();

            match result {
                Ok((response, envelope)) => {
                    tracing::Span::current().record("http.status_code", response.status.as_u16());
                    tracing::debug!(
                        status = response.status.as_u16(),
                        elapsed_ms = duration.as_millis() as u64,
                        mediator = envelope.is_some(),
                        "Route completed"
                    );

                    let mut outcome = RouteOutcome {
                        response: Some(response.snapshot()),
                        error: None,
                        ..RouteOutcome::failed(
                            route.name.clone(),
                            route.primary,
                            snapshot,
                            "",
                            duration,
                        )
                    };
                    if let Some(envelope) = &envelope {
                        outcome = outcome.with_mediator(envelope);
                        crate::metrics::record_mediator_metrics(
                            channel,
                            &route.name,
                            &envelope.metrics,
                        );
                        for orchestration in &envelope.orchestrations {
                            crate::metrics::record_mediator_metrics(
                                channel,
                                &route.name,
                                &orchestration.metrics,
                            );
                        }
                    }

                    crate::metrics::record_route_request(
                        channel,
                        &route.name,
                        response.status.as_str(),
                        route.primary,
                        duration,
                    );

                    RouteAttempt {
                        outcome,
                        response: Ok(response),
                    }
                }
                Err(reason) => {
                    tracing::warn!(
                        error = %reason,
                        elapsed_ms = duration.as_millis() as u64,
                        "Route failed"
                    );
                    crate::metrics::record_route_request(
                        channel,
                        &route.name,
                        "error",
                        route.primary,
                        duration,
                    );

                    RouteAttempt {
                        outcome: RouteOutcome::failed(
                            route.name.clone(),
                            route.primary,
                            snapshot,
                            reason.clone(),
                            duration,
                        ),
                        response: Err(reason),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method, StatusCode, header};

    use super::*;
    use crate::{
        adapters::recorder::InMemoryRecorder,
        config::{ChannelConfig, RouteConfig, RouterConfig},
        ports::{
            http_client::{HttpClientError, HttpClientResult, OutboundRequest, UpstreamResponse},
            socket_client::{SocketClientError, SocketClientResult},
            transaction_recorder::RecorderResult,
        },
    };

    /// Answers by route port: 1000 + status, e.g. port 1201 answers 201.
    #[derive(Default)]
    struct PortStatusClient {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl HttpClient for PortStatusClient {
        async fn forward(
            &self,
            route: &Route,
            request: OutboundRequest,
        ) -> HttpClientResult<UpstreamResponse> {
            self.seen
                .lock()
                .unwrap()
                .push((route.name.clone(), request.path.clone()));

            if route.port == 1 {
                return Err(HttpClientError::ConnectionError("refused".into()));
            }
            if route.port == 2 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            let status = route
                .port
                .checked_sub(1000)
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            Ok(UpstreamResponse {
                status,
                headers: HeaderMap::new(),
                body: Bytes::from(format!("{} says {}", route.name, status.as_u16())),
            })
        }
    }

    struct EchoSocket;

    #[async_trait]
    impl SocketClient for EchoSocket {
        async fn forward(&self, route: &Route, payload: Bytes) -> SocketClientResult<Bytes> {
            if route.port == 1 {
                return Err(SocketClientError::ConnectionError(
                    route.authority(),
                    "refused".into(),
                ));
            }
            Ok(payload)
        }
    }

    fn dispatcher(recorder: Arc<InMemoryRecorder>) -> MulticastDispatcher {
        MulticastDispatcher::new(
            Arc::new(PortStatusClient::default()),
            Arc::new(EchoSocket),
            recorder,
            SecondaryTasks::new(),
        )
    }

    fn channel(config: ChannelConfig) -> Arc<Channel> {
        Arc::new(Channel::compile(0, &config, &RouterConfig::default()).unwrap())
    }

    fn get(path: &str) -> InboundRequest {
        InboundRequest::http(Method::GET, path, None, HeaderMap::new(), Bytes::new())
    }

    #[tokio::test]
    async fn test_multicast_returns_primary_and_records_secondaries() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let dispatcher = dispatcher(recorder.clone());
        let channel = channel(
            ChannelConfig::http("multicast", "^/test")
                .with_route(RouteConfig::new("ok", "localhost", 1200))
                .with_route(RouteConfig::new("created", "localhost", 1201).primary())
                .with_route(RouteConfig::new("bad", "localhost", 1400)),
        );

        let result = dispatcher.dispatch(channel, get("/test/multicast")).await.unwrap();
        assert_eq!(result.response.status, StatusCode::CREATED);
        assert_eq!(&result.response.body[..], b"created says 201");

        assert!(dispatcher.tasks().drain(Duration::from_secs(5)).await);

        let tx = recorder.get(result.transaction_id).await.unwrap();
        assert_eq!(tx.primary.status(), Some(201));
        assert_eq!(tx.routes.len(), 2);

        let mut secondary: Vec<_> = tx
            .routes
            .iter()
            .map(|r| {
                let response = r.response.as_ref().unwrap();
                (response.status, String::from_utf8_lossy(&response.body).into_owned())
            })
            .collect();
        secondary.sort();
        assert_eq!(
            secondary,
            vec![
                (200, "ok says 200".to_string()),
                (400, "bad says 400".to_string())
            ]
        );
        assert_eq!(tx.status, TransactionStatus::CompletedWithErrors);
    }

    #[tokio::test]
    async fn test_primary_does_not_wait_for_slow_secondary() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let dispatcher = dispatcher(recorder.clone());
        let channel = channel(
            ChannelConfig::http("slow", "/")
                .with_route(RouteConfig::new("primary", "localhost", 1200).primary())
                .with_route(RouteConfig::new("slow", "localhost", 2)),
        );

        let started = std::time::Instant::now();
        let result = dispatcher.dispatch(channel, get("/")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(recorder.get(result.transaction_id).await.unwrap().routes.is_empty());

        dispatcher.tasks().drain(Duration::from_secs(5)).await;
        assert_eq!(
            recorder.get(result.transaction_id).await.unwrap().routes.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_is_still_recorded() {
        /// Remembers which transactions were recorded, keeping the outcomes in memory.
        #[derive(Default)]
        struct Ledger {
            ids: Mutex<Vec<Uuid>>,
            inner: InMemoryRecorder,
        }

        #[async_trait]
        impl TransactionRecorder for Ledger {
            async fn record_transaction(
                &self,
                transaction: &TransactionOutcome,
            ) -> RecorderResult<()> {
                self.ids.lock().unwrap().push(transaction.id);
                self.inner.record_transaction(transaction).await
            }

            async fn record_route(
                &self,
                transaction_id: Uuid,
                route: &RouteOutcome,
            ) -> RecorderResult<()> {
                self.inner.record_route(transaction_id, route).await
            }
        }

        let ledger = Arc::new(Ledger::default());
        let dispatcher = MulticastDispatcher::new(
            Arc::new(PortStatusClient::default()),
            Arc::new(EchoSocket),
            ledger.clone(),
            SecondaryTasks::new(),
        );
        let channel = channel(
            ChannelConfig::http("abandoned", "/")
                .with_route(RouteConfig::new("slow primary", "localhost", 2).primary())
                .with_route(RouteConfig::new("fast", "localhost", 1200)),
        );

        let gave_up =
            tokio::time::timeout(Duration::from_millis(50), dispatcher.dispatch(channel, get("/")))
                .await;
        assert!(gave_up.is_err());

        assert!(dispatcher.tasks().drain(Duration::from_secs(5)).await);

        let ids = ledger.ids.lock().unwrap().clone();
        assert_eq!(ids.len(), 1);
        let tx = ledger.inner.get(ids[0]).await.unwrap();
        assert_eq!(tx.primary.status(), Some(200));
        assert_eq!(tx.routes.len(), 1);
        assert_eq!(tx.routes[0].name, "fast");
    }

    #[tokio::test]
    async fn test_multiple_enabled_primaries_fail() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let dispatcher = dispatcher(recorder.clone());
        let channel = channel(
            ChannelConfig::http("twice", "/")
                .with_route(RouteConfig::new("a", "localhost", 1200).primary())
                .with_route(RouteConfig::new("b", "localhost", 1201).primary()),
        );

        let err = dispatcher.dispatch(channel, get("/")).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::MultiplePrimaryRoutes { count: 2, .. }
        ));
        assert!(err.is_configuration());
        assert_eq!(recorder.len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_primary_is_ignored() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let dispatcher = dispatcher(recorder.clone());
        let channel = channel(
            ChannelConfig::http("one live primary", "/")
                .with_route(RouteConfig::new("live", "localhost", 1202).primary())
                .with_route(RouteConfig::new("retired", "localhost", 1500).primary().disabled()),
        );

        let result = dispatcher.dispatch(channel, get("/")).await.unwrap();
        assert_eq!(result.response.status, StatusCode::ACCEPTED);
        dispatcher.tasks().drain(Duration::from_secs(1)).await;
        assert!(recorder.get(result.transaction_id).await.unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn test_no_enabled_primary_fails() {
        let channel = channel(
            ChannelConfig::http("none", "/")
                .with_route(RouteConfig::new("a", "localhost", 1200).primary().disabled())
                .with_route(RouteConfig::new("b", "localhost", 1200)),
        );
        assert!(matches!(
            MulticastDispatcher::primary_route(&channel),
            Err(DispatchError::NoPrimaryRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_failure_is_recorded_and_reported() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let dispatcher = dispatcher(recorder.clone());
        let channel = channel(
            ChannelConfig::http("down", "/")
                .with_route(RouteConfig::new("gone", "localhost", 1).primary()),
        );

        let err = dispatcher.dispatch(channel, get("/")).await.unwrap_err();
        let DispatchError::PrimaryRouteFailed { transaction_id, .. } = err else {
            panic!("expected primary failure, got {err:?}");
        };
        let tx = recorder.get(transaction_id).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(tx.primary.error.as_deref().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_mediator_envelope_overrides_response() {
        struct MediatorClient;

        #[async_trait]
        impl HttpClient for MediatorClient {
            async fn forward(
                &self,
                _route: &Route,
                _request: OutboundRequest,
            ) -> HttpClientResult<UpstreamResponse> {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json+openhim"),
                );
                Ok(UpstreamResponse {
                    status: StatusCode::CREATED,
                    headers,
                    body: Bytes::from_static(
                        br#"{
                            "x-mediator-urn": "urn:mediator:validator",
                            "status": "Completed",
                            "response": { "status": 400, "headers": { "x-reason": "invalid" }, "body": "rejected" },
                            "orchestrations": [{ "name": "validate", "response": { "status": 400 } }],
                            "properties": { "checked": true }
                        }"#,
                    ),
                })
            }
        }

        let recorder = Arc::new(InMemoryRecorder::new());
        let dispatcher = MulticastDispatcher::new(
            Arc::new(MediatorClient),
            Arc::new(EchoSocket),
            recorder.clone(),
            SecondaryTasks::new(),
        );
        let channel = channel(
            ChannelConfig::http("mediated", "/")
                .with_route(RouteConfig::new("mediator", "localhost", 8080).primary()),
        );

        let result = dispatcher.dispatch(channel, get("/")).await.unwrap();
        assert_eq!(result.response.status, StatusCode::BAD_REQUEST);
        assert_eq!(result.response.headers["x-reason"], "invalid");
        assert_eq!(&result.response.body[..], b"rejected");
        assert_eq!(result.status, TransactionStatus::Completed);

        let tx = recorder.get(result.transaction_id).await.unwrap();
        assert_eq!(tx.primary.orchestrations[0].name, "validate");
        assert_eq!(tx.primary.mediator_urn.as_deref(), Some("urn:mediator:validator"));
        assert_eq!(tx.primary.properties["checked"], serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn test_socket_routes_use_socket_client() {
        let recorder = Arc::new(InMemoryRecorder::new());
        let dispatcher = dispatcher(recorder);
        let channel = channel(
            ChannelConfig::socket("adt", crate::config::ChannelType::Tcp, "127.0.0.1", 2575)
                .with_route(RouteConfig::new("ehr", "localhost", 6661).primary()),
        );

        let payload = Bytes::from_static(b"\x0bMSH|^~\\&|ADT\r\x1c\r");
        let result = dispatcher
            .dispatch(channel, InboundRequest::socket(payload.clone(), None, false))
            .await
            .unwrap();
        assert_eq!(result.response.body, payload);
    }
}
