//! Per-dispatch outcome records handed to the transaction recording collaborator.
//!
//! A [`TransactionOutcome`] is built once the primary route completes. Secondary routes finish
//! on their own schedule and arrive later as separate [`RouteOutcome`]s keyed by transaction id.
use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, header};
use serde::{Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::core::mediator::{MediatorMetric, MediatorResponse, Orchestration};

fn lossy_body<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

fn duration_millis<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_millis() as u64)
}

/// Flatten a header map for recording. Repeated headers are joined with `, ` and
/// credentials are masked.
pub fn header_snapshot(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut snapshot: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let text = if name == header::AUTHORIZATION || name == header::PROXY_AUTHORIZATION {
            "***".to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        snapshot
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&text);
            })
            .or_insert(text);
    }
    snapshot
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub method: String,
    pub path: String,
    pub querystring: Option<String>,
    pub headers: BTreeMap<String, String>,
    #[serde(serialize_with = "lossy_body")]
    pub body: Bytes,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(serialize_with = "lossy_body")]
    pub body: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Result of forwarding to a single route.
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub name: String,
    pub primary: bool,
    pub request: RequestSnapshot,
    /// Effective response: the mediator's declared response when an envelope was returned
    pub response: Option<ResponseSnapshot>,
    pub error: Option<String>,
    #[serde(serialize_with = "duration_millis")]
    pub duration: Duration,
    pub mediator_urn: Option<String>,
    pub mediator_status: Option<String>,
    pub orchestrations: Vec<Orchestration>,
    pub properties: BTreeMap<String, Value>,
    pub metrics: Vec<MediatorMetric>,
}

impl RouteOutcome {
    pub fn failed(
        name: impl Into<String>,
        primary: bool,
        request: RequestSnapshot,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            primary,
            request,
            response: None,
            error: Some(error.into()),
            duration,
            mediator_urn: None,
            mediator_status: None,
            orchestrations: Vec::new(),
            properties: BTreeMap::new(),
            metrics: Vec::new(),
        }
    }

    /// Attach the envelope's orchestration data to this route.
    pub fn with_mediator(mut self, envelope: &MediatorResponse) -> Self {
        self.mediator_urn = envelope.mediator_urn.clone();
        self.mediator_status = envelope.status.clone();
        self.orchestrations = envelope.orchestrations.clone();
        self.properties = envelope.properties.clone();
        self.metrics = envelope.metrics.clone();
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    /// Completed with a 2xx response.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.status().is_some_and(|s| (200..300).contains(&s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionStatus {
    Processing,
    Successful,
    Completed,
    #[serde(rename = "Completed with error(s)")]
    CompletedWithErrors,
    Failed,
}

impl TransactionStatus {
    fn from_mediator(status: &str) -> Option<Self> {
        match status {
            "Processing" => Some(TransactionStatus::Processing),
            "Successful" => Some(TransactionStatus::Successful),
            "Completed" => Some(TransactionStatus::Completed),
            "Completed with error(s)" => Some(TransactionStatus::CompletedWithErrors),
            "Failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    /// Status implied by the primary route alone.
    pub fn from_primary(primary: &RouteOutcome) -> Self {
        if let Some(declared) = primary
            .mediator_status
            .as_deref()
            .and_then(Self::from_mediator)
        {
            return declared;
        }

        match primary.status() {
            None => TransactionStatus::Failed,
            Some(status) if status >= 500 => TransactionStatus::Failed,
            Some(status) if (200..300).contains(&status) => TransactionStatus::Successful,
            Some(_) => TransactionStatus::Completed,
        }
    }

    /// Fold a late secondary result into an already recorded status.
    pub fn with_secondary(self, secondary: &RouteOutcome) -> Self {
        match self {
            TransactionStatus::Successful if !secondary.succeeded() => {
                TransactionStatus::CompletedWithErrors
            }
            other => other,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Processing => write!(f, "Processing"),
            TransactionStatus::Successful => write!(f, "Successful"),
            TransactionStatus::Completed => write!(f, "Completed"),
            TransactionStatus::CompletedWithErrors => write!(f, "Completed with error(s)"),
            TransactionStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// One record per dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionOutcome {
    pub id: Uuid,
    pub channel: String,
    pub request: RequestSnapshot,
    pub primary: RouteOutcome,
    /// Secondary routes; filled in by the recorder as they complete
    pub routes: Vec<RouteOutcome>,
    pub status: TransactionStatus,
}

impl TransactionOutcome {
    pub fn new(
        id: Uuid,
        channel: impl Into<String>,
        request: RequestSnapshot,
        primary: RouteOutcome,
    ) -> Self {
        let status = TransactionStatus::from_primary(&primary);
        Self {
            id,
            channel: channel.into(),
            request,
            primary,
            routes: Vec::new(),
            status,
        }
    }

    /// Append a secondary route and update the status accordingly.
    pub fn push_route(&mut self, route: RouteOutcome) {
        self.status = self.status.with_secondary(&route);
        self.routes.push(route);
    }
}
