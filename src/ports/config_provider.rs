use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::ServerConfig;

/// Source of channel and route configuration (a local file, an administrative API, ...).
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration. Validation is the caller's concern.
    async fn load_config(&self) -> Result<ServerConfig>;

    /// Signals that the configuration may have changed.
    ///
    /// The receiver is handed out once; later calls return a closed channel.
    fn watch(&self) -> mpsc::Receiver<()>;

    /// Short description used in logs.
    fn describe(&self) -> String;
}
