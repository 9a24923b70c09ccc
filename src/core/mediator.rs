//! Mediator response envelopes.
//!
//! A mediator is an upstream that answers with a structured JSON envelope, marked by the
//! `application/json+openhim` content type, instead of a plain response. [`classify`] is the
//! single place that decides between the two; everything downstream branches on
//! [`UpstreamBody`]. A body that carries the marker but fails to parse is treated as raw.
use std::collections::BTreeMap;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Content type announcing a mediator envelope.
pub const MEDIATOR_CONTENT_TYPE: &str = "application/json+openhim";

/// The response the mediator wants the original caller to see.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediatorHttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl MediatorHttpResponse {
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status).ok()
    }

    /// Header map built from the envelope; entries that are not valid HTTP headers are dropped.
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&text),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::debug!(header = %name, "Dropping invalid mediator header"),
            }
        }
        headers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrchestrationRequest {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<Value>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub querystring: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OrchestrationResponse {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A named sub-request the mediator made while handling the route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Orchestration {
    pub name: String,
    #[serde(default)]
    pub request: OrchestrationRequest,
    #[serde(default)]
    pub response: OrchestrationResponse,
    #[serde(default)]
    pub metrics: Vec<MediatorMetric>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Timer,
}

/// A custom metric declared by a mediator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediatorMetric {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub value: f64,
}

/// The parsed envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediatorResponse {
    #[serde(rename = "x-mediator-urn", default)]
    pub mediator_urn: Option<String>,
    /// `Successful`, `Completed`, `Failed`, ... as declared by the mediator
    #[serde(default)]
    pub status: Option<String>,
    pub response: MediatorHttpResponse,
    #[serde(default)]
    pub orchestrations: Vec<Orchestration>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub metrics: Vec<MediatorMetric>,
}

/// Body of an upstream HTTP response after envelope detection.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamBody {
    Raw(Bytes),
    Mediator(Box<MediatorResponse>),
}

fn has_mediator_marker(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(MEDIATOR_CONTENT_TYPE))
}

/// Decide whether `body` is a mediator envelope.
pub fn classify(headers: &HeaderMap, body: Bytes) -> UpstreamBody {
    if !has_mediator_marker(headers) {
        return UpstreamBody::Raw(body);
    }

    match serde_json::from_slice::<MediatorResponse>(&body) {
        Ok(envelope) if envelope.response.status_code().is_some() => {
            UpstreamBody::Mediator(Box::new(envelope))
        }
        Ok(envelope) => {
            tracing::warn!(
                status = envelope.response.status,
                "Mediator envelope carries an invalid status, using raw response"
            );
            UpstreamBody::Raw(body)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Malformed mediator envelope, using raw response");
            UpstreamBody::Raw(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mediator_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json+openhim; charset=utf-8"),
        );
        headers
    }

    #[test]
    fn test_plain_json_is_raw() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = Bytes::from_static(br#"{"response":{"status":200}}"#);

        assert_eq!(classify(&headers, body.clone()), UpstreamBody::Raw(body));
    }

    #[test]
    fn test_envelope_is_parsed() {
        let body = Bytes::from_static(
            br#"{
                "x-mediator-urn": "urn:mediator:test",
                "status": "Successful",
                "response": {
                    "status": 400,
                    "headers": { "x-custom": "yes", "x-count": 3 },
                    "body": "bad request"
                },
                "orchestrations": [{
                    "name": "lookup",
                    "request": { "path": "/lookup", "method": "GET" },
                    "response": { "status": 200, "body": "found" },
                    "metrics": [{ "name": "lookups", "type": "counter", "value": 1 }]
                }],
                "properties": { "patient": "123" },
                "metrics": [{ "name": "latency", "type": "timer", "value": 12.5 }]
            }"#,
        );

        let UpstreamBody::Mediator(envelope) = classify(&mediator_headers(), body) else {
            panic!("expected mediator envelope");
        };
        assert_eq!(envelope.mediator_urn.as_deref(), Some("urn:mediator:test"));
        assert_eq!(envelope.response.status, 400);
        assert_eq!(envelope.orchestrations[0].name, "lookup");
        assert_eq!(envelope.orchestrations[0].metrics[0].kind, MetricKind::Counter);
        assert_eq!(envelope.metrics[0].kind, MetricKind::Timer);
        assert_eq!(envelope.properties["patient"], Value::from("123"));

        let headers = envelope.response.header_map();
        assert_eq!(headers["x-custom"], "yes");
        assert_eq!(headers["x-count"], "3");
    }

    #[test]
    fn test_malformed_envelope_falls_back_to_raw() {
        let body = Bytes::from_static(b"{ not json");
        assert_eq!(
            classify(&mediator_headers(), body.clone()),
            UpstreamBody::Raw(body)
        );

        let missing_response = Bytes::from_static(br#"{"status":"Successful"}"#);
        assert!(matches!(
            classify(&mediator_headers(), missing_response),
            UpstreamBody::Raw(_)
        ));

        let bad_status = Bytes::from_static(br#"{"response":{"status":42}}"#);
        assert!(matches!(
            classify(&mediator_headers(), bad_status),
            UpstreamBody::Raw(_)
        ));
    }
}
