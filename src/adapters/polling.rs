//! Timer-driven dispatch for `polling` channels.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::{config::ChannelType, core::GatewayService};

/// Fires every enabled polling channel at its interval against the current gateway snapshot.
pub struct PollingScheduler {
    gateway: Arc<ArcSwap<GatewayService>>,
    running: CancellationToken,
}

impl PollingScheduler {
    pub fn new(gateway: Arc<ArcSwap<GatewayService>>) -> Self {
        Self {
            gateway,
            running: CancellationToken::new(),
        }
    }

    /// Replace the running schedule with the polling channels of the current snapshot.
    ///
    /// Returns the number of channels scheduled.
    pub fn reschedule(&mut self) -> usize {
        self.running.cancel();
        self.running = CancellationToken::new();

        let snapshot = self.gateway.load();
        let mut scheduled = 0;
        for channel in snapshot.registry().enabled_of_kind(ChannelType::Polling) {
            let Some(period) = channel.polling_interval else {
                tracing::warn!(channel = %channel.name, "Polling channel without polling_interval");
                continue;
            };

            tokio::spawn(poll(
                self.gateway.clone(),
                channel.name.clone(),
                period,
                self.running.clone(),
            ));
            scheduled += 1;
        }

        tracing::info!(channels = scheduled, "Polling schedule updated");
        scheduled
    }

    pub fn stop(&self) {
        self.running.cancel();
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.running.cancel();
    }
}

async fn poll(
    gateway: Arc<ArcSwap<GatewayService>>,
    channel: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = gateway.load_full();
        match snapshot.trigger_polling(&channel).await {
            Ok(result) => tracing::debug!(
                channel = %channel,
                transaction_id = %result.transaction_id,
                status = %result.status,
                "Polling channel fired"
            ),
            Err(e) => tracing::warn!(channel = %channel, error = %e, "Polling dispatch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::*;
    use crate::{
        adapters::{SocketClientAdapter, recorder::InMemoryRecorder},
        config::{ChannelConfig, RouteConfig, ServerConfig},
        core::{MulticastDispatcher, Route, SecondaryTasks},
        ports::http_client::{HttpClient, HttpClientResult, OutboundRequest, UpstreamResponse},
    };

    #[derive(Default)]
    struct CountingClient(AtomicUsize);

    #[async_trait]
    impl HttpClient for CountingClient {
        async fn forward(
            &self,
            _route: &Route,
            request: OutboundRequest,
        ) -> HttpClientResult<UpstreamResponse> {
            assert_eq!(request.path, "/poll");
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_polling_channel_fires_repeatedly() {
        let mut channel = ChannelConfig::http("poller", "^/trigger$")
            .with_route(RouteConfig::new("source", "127.0.0.1", 1).primary().with_path("/poll"));
        channel.channel_type = ChannelType::Polling;
        channel.polling_interval = Some("50ms".into());

        let config = Arc::new(ServerConfig {
            channels: vec![channel],
            ..ServerConfig::default()
        });
        let client = Arc::new(CountingClient::default());
        let dispatcher = MulticastDispatcher::new(
            client.clone(),
            Arc::new(SocketClientAdapter::new(1024).unwrap()),
            Arc::new(InMemoryRecorder::new()),
            SecondaryTasks::new(),
        );
        let gateway = GatewayService::new(config, dispatcher).unwrap();

        let mut scheduler = PollingScheduler::new(Arc::new(ArcSwap::from_pointee(gateway)));
        assert_eq!(scheduler.reschedule(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop();
        let fired = client.0.load(Ordering::SeqCst);
        assert!(fired >= 2, "fired {fired} times");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(client.0.load(Ordering::SeqCst) <= fired + 1);
    }
}
