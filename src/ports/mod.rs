//! Traits at the I/O seams of the switch. `core` depends only on these; `adapters` implement them.
pub mod audit_sink;
pub mod authenticator;
pub mod config_provider;
pub mod http_client;
pub mod socket_client;
pub mod transaction_recorder;
