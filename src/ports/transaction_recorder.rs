use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::core::transaction::{RouteOutcome, TransactionOutcome};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RecorderError {
    /// A route arrived for a transaction that was never recorded
    #[error("unknown transaction {0}")]
    UnknownTransaction(Uuid),

    #[error("recorder backend failure: {0}")]
    Backend(String),
}

pub type RecorderResult<T> = Result<T, RecorderError>;

/// Persistence collaborator for dispatch outcomes.
///
/// `record_transaction` is called once per dispatch after the primary route completes.
/// `record_route` is called for each secondary route, never before the transaction it
/// belongs to has been recorded.
#[async_trait]
pub trait TransactionRecorder: Send + Sync + 'static {
    async fn record_transaction(&self, transaction: &TransactionOutcome) -> RecorderResult<()>;

    async fn record_route(&self, transaction_id: Uuid, route: &RouteOutcome)
    -> RecorderResult<()>;
}
