pub mod audit_listener;
pub mod authenticator;
pub mod config_providers;
pub mod http_client;
pub mod http_handler;
pub mod polling;
pub mod recorder;
pub mod socket_client;
pub mod socket_listener;
pub mod tls;

/// Re-export commonly used types from adapters
pub use audit_listener::{AuditListener, TracingAuditSink};
pub use authenticator::HeaderAuthenticator;
pub use config_providers::{FileConfigProvider, HttpConfigProvider};
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use polling::PollingScheduler;
pub use recorder::{InMemoryRecorder, TracingRecorder};
pub use socket_client::SocketClientAdapter;
pub use socket_listener::{ListenerKey, SocketListeners};
