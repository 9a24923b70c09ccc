//! Statistics emission for interlink.
//!
//! Thin helpers over the `metrics` crate macros. No exporter is installed here; the embedding
//! process chooses one. Metric names are described once on first use.
//!
//! Provided metrics (labels vary by family):
//! * `interlink_requests_total` (counter, ingress)
//! * `interlink_request_duration_seconds` (histogram, ingress)
//! * `interlink_route_requests_total` (counter, one per completed route)
//! * `interlink_route_duration_seconds` (histogram)
//! * `interlink_transactions_total` (counter, by derived status)
//! * `interlink_mediator_counter` / `_gauge` / `_timer_seconds` (mediator-declared)
//! * `interlink_active_connections` (gauge)
//! * `interlink_socket_connections_total` (counter, by listener protocol)
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

use crate::core::{
    mediator::{MediatorMetric, MetricKind},
    transaction::TransactionStatus,
};

pub const INTERLINK_REQUESTS_TOTAL: &str = "interlink_requests_total";
pub const INTERLINK_REQUEST_DURATION_SECONDS: &str = "interlink_request_duration_seconds";
pub const INTERLINK_ROUTE_REQUESTS_TOTAL: &str = "interlink_route_requests_total";
pub const INTERLINK_ROUTE_DURATION_SECONDS: &str = "interlink_route_duration_seconds";
pub const INTERLINK_TRANSACTIONS_TOTAL: &str = "interlink_transactions_total";
pub const INTERLINK_MEDIATOR_COUNTER: &str = "interlink_mediator_counter";
pub const INTERLINK_MEDIATOR_GAUGE: &str = "interlink_mediator_gauge";
pub const INTERLINK_MEDIATOR_TIMER_SECONDS: &str = "interlink_mediator_timer_seconds";
pub const INTERLINK_ACTIVE_CONNECTIONS: &str = "interlink_active_connections";
pub const INTERLINK_SOCKET_CONNECTIONS_TOTAL: &str = "interlink_socket_connections_total";

/// Last value of every mediator-declared gauge, keyed `channel/route/name`.
pub static MEDIATOR_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        INTERLINK_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests received on the ingress listener."
    );
    describe_histogram!(
        INTERLINK_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests received on the ingress listener."
    );
    describe_counter!(
        INTERLINK_ROUTE_REQUESTS_TOTAL,
        Unit::Count,
        "Requests forwarded to routes, by channel, route, status and primary flag."
    );
    describe_histogram!(
        INTERLINK_ROUTE_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to routes."
    );
    describe_counter!(
        INTERLINK_TRANSACTIONS_TOTAL,
        Unit::Count,
        "Dispatched transactions by channel and derived status."
    );
    describe_counter!(
        INTERLINK_MEDIATOR_COUNTER,
        Unit::Count,
        "Counters declared by mediators in their response envelopes."
    );
    describe_gauge!(
        INTERLINK_MEDIATOR_GAUGE,
        "Gauges declared by mediators in their response envelopes."
    );
    describe_histogram!(
        INTERLINK_MEDIATOR_TIMER_SECONDS,
        Unit::Seconds,
        "Timers declared by mediators in their response envelopes."
    );
    describe_gauge!(
        INTERLINK_ACTIVE_CONNECTIONS,
        "Number of currently active ingress connections."
    );
    describe_counter!(
        INTERLINK_SOCKET_CONNECTIONS_TOTAL,
        Unit::Count,
        "Connections accepted by socket listeners."
    );

    Mutex::new(HashMap::new())
});

/// Increment the total request counter for an ingress request.
pub fn increment_request_total(channel: &str, method: &str, status: u16) {
    counter!(
        INTERLINK_REQUESTS_TOTAL,
        "channel" => channel.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(method: &str, duration: Duration) {
    histogram!(INTERLINK_REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record one completed route. `status` is the response code, or `error` when the route failed.
pub fn record_route_request(
    channel: &str,
    route: &str,
    status: &str,
    primary: bool,
    duration: Duration,
) {
    counter!(
        INTERLINK_ROUTE_REQUESTS_TOTAL,
        "channel" => channel.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string(),
        "primary" => primary.to_string()
    )
    .increment(1);

    histogram!(
        INTERLINK_ROUTE_DURATION_SECONDS,
        "channel" => channel.to_string(),
        "route" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_transaction(channel: &str, status: TransactionStatus) {
    counter!(
        INTERLINK_TRANSACTIONS_TOTAL,
        "channel" => channel.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Emit metrics declared by a mediator for `route`. Timer values are milliseconds.
pub fn record_mediator_metrics(channel: &str, route: &str, declared: &[MediatorMetric]) {
    for metric in declared {
        let labels = [
            ("channel", channel.to_string()),
            ("route", route.to_string()),
            ("name", metric.name.clone()),
        ];

        match metric.kind {
            MetricKind::Counter => {
                if metric.value.is_finite() && metric.value >= 0.0 {
                    counter!(INTERLINK_MEDIATOR_COUNTER, &labels).increment(metric.value as u64);
                }
            }
            MetricKind::Gauge => {
                gauge!(INTERLINK_MEDIATOR_GAUGE, &labels).set(metric.value);
                if let Ok(mut gauges) = MEDIATOR_GAUGES.lock() {
                    gauges.insert(format!("{channel}/{route}/{}", metric.name), metric.value);
                } else {
                    tracing::error!("Failed to acquire lock for mediator gauges");
                }
            }
            MetricKind::Timer => {
                histogram!(INTERLINK_MEDIATOR_TIMER_SECONDS, &labels)
                    .record(metric.value / 1000.0);
            }
        }
    }
}

/// Set current active connection count.
pub fn set_active_connections(count: usize) {
    gauge!(INTERLINK_ACTIVE_CONNECTIONS).set(count as f64);
}

pub fn increment_socket_connections(protocol: &str) {
    counter!(INTERLINK_SOCKET_CONNECTIONS_TOTAL, "protocol" => protocol.to_string()).increment(1);
}

/// RAII helper measuring ingress request duration.
pub struct RequestTimer {
    start: Instant,
    method: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&MEDIATOR_GAUGES);
    tracing::info!("Interlink metrics initialized");
    Ok(())
}

/// Snapshot of the last mediator gauge values.
pub fn get_current_metrics() -> HashMap<String, f64> {
    MEDIATOR_GAUGES
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mediator_gauges_are_retained() {
        record_mediator_metrics(
            "lab",
            "validator",
            &[
                MediatorMetric {
                    name: "queue_depth".into(),
                    kind: MetricKind::Gauge,
                    value: 7.0,
                },
                MediatorMetric {
                    name: "lookups".into(),
                    kind: MetricKind::Counter,
                    value: 2.0,
                },
            ],
        );

        let snapshot = get_current_metrics();
        assert_eq!(snapshot.get("lab/validator/queue_depth"), Some(&7.0));
        assert!(!snapshot.contains_key("lab/validator/lookups"));
    }

    #[test]
    fn test_request_timer() {
        let timer = RequestTimer::new("GET");
        // Timer will record duration when dropped
        drop(timer);
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
    }
}
