//! Transaction recorders.
//!
//! [`TracingRecorder`] writes every outcome to the `interlink::transactions` log target as
//! structured JSON; it is the default when no persistence collaborator is wired in.
//! [`InMemoryRecorder`] keeps outcomes addressable by id.
use async_trait::async_trait;
use scc::HashMap;
use uuid::Uuid;

use crate::{
    core::transaction::{RouteOutcome, TransactionOutcome},
    ports::transaction_recorder::{RecorderError, RecorderResult, TransactionRecorder},
};

/// Keeps every recorded transaction in memory.
#[derive(Default)]
pub struct InMemoryRecorder {
    transactions: HashMap<Uuid, TransactionOutcome>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a transaction, secondary routes included.
    pub async fn get(&self, transaction_id: Uuid) -> Option<TransactionOutcome> {
        self.transactions
            .read_async(&transaction_id, |_, tx| tx.clone())
            .await
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[async_trait]
impl TransactionRecorder for InMemoryRecorder {
    async fn record_transaction(&self, transaction: &TransactionOutcome) -> RecorderResult<()> {
        self.transactions
            .insert_async(transaction.id, transaction.clone())
            .await
            .map_err(|(id, _)| RecorderError::Backend(format!("transaction {id} already recorded")))
    }

    async fn record_route(&self, transaction_id: Uuid, route: &RouteOutcome) -> RecorderResult<()> {
        self.transactions
            .update_async(&transaction_id, |_, tx| tx.push_route(route.clone()))
            .await
            .ok_or(RecorderError::UnknownTransaction(transaction_id))
    }
}

/// Logs outcomes instead of persisting them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

#[async_trait]
impl TransactionRecorder for TracingRecorder {
    async fn record_transaction(&self, transaction: &TransactionOutcome) -> RecorderResult<()> {
        let record = serde_json::to_string(transaction)
            .map_err(|e| RecorderError::Backend(e.to_string()))?;
        tracing::info!(
            target: "interlink::transactions",
            transaction_id = %transaction.id,
            channel = %transaction.channel,
            status = %transaction.status,
            record = %record,
            "Transaction recorded"
        );
        Ok(())
    }

    async fn record_route(&self, transaction_id: Uuid, route: &RouteOutcome) -> RecorderResult<()> {
        let record =
            serde_json::to_string(route).map_err(|e| RecorderError::Backend(e.to_string()))?;
        tracing::info!(
            target: "interlink::transactions",
            transaction_id = %transaction_id,
            route = %route.name,
            record = %record,
            "Route recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderMap, Method};

    use super::*;
    use crate::core::{request::InboundRequest, transaction::TransactionStatus};

    fn transaction() -> TransactionOutcome {
        let request = InboundRequest::http(Method::GET, "/", None, HeaderMap::new(), Bytes::new())
            .snapshot();
        let primary = RouteOutcome::failed(
            "primary",
            true,
            request.clone(),
            "connection refused",
            Duration::from_millis(3),
        );
        TransactionOutcome::new(Uuid::new_v4(), "c", request, primary)
    }

    #[tokio::test]
    async fn test_route_requires_recorded_transaction() {
        let recorder = InMemoryRecorder::new();
        let tx = transaction();
        let secondary = tx.primary.clone();

        let err = recorder.record_route(tx.id, &secondary).await.unwrap_err();
        assert!(matches!(err, RecorderError::UnknownTransaction(id) if id == tx.id));

        recorder.record_transaction(&tx).await.unwrap();
        recorder.record_route(tx.id, &secondary).await.unwrap();

        let stored = recorder.get(tx.id).await.unwrap();
        assert_eq!(stored.routes.len(), 1);
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(recorder.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_transaction_rejected() {
        let recorder = InMemoryRecorder::new();
        let tx = transaction();
        recorder.record_transaction(&tx).await.unwrap();
        assert!(recorder.record_transaction(&tx).await.is_err());
    }

    #[tokio::test]
    async fn test_tracing_recorder_accepts_everything() {
        let tx = transaction();
        assert!(TracingRecorder.record_transaction(&tx).await.is_ok());
        assert!(TracingRecorder.record_route(tx.id, &tx.primary).await.is_ok());
    }
}
