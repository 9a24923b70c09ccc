//! Interlink - a health-interoperability switch.
//!
//! Interlink accepts HTTP requests and TCP, TLS or MLLP messages, matches each one to a
//! configured **channel**, and multicasts it to the channel's **routes**. Exactly one enabled
//! route per channel is the primary: its response, or the response a mediator returns on its
//! behalf, goes back to the caller. Every other route receives a copy in the background and
//! its outcome is only recorded.
//!
//! # Features
//! - Channel matching by URL pattern, priority, declaration order and caller roles
//! - Per-route path rewriting (`path` replacement or `s/from/to[/g]` substitution)
//! - HTTP, TCP and MLLP routes, plain or over TLS with named certificate profiles
//! - Mediator response envelopes overlaying the caller's response
//! - TCP / TLS listeners with MLLP framing, polling channels and an audit intake listener
//! - Live configuration hot‑reload with validation and atomic snapshot swaps
//! - Structured tracing via `tracing`, statistics via the `metrics` facade
//! - Graceful shutdown draining listeners and in-flight secondary routes
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use interlink::{
//!     GatewayService,
//!     adapters::{HttpClientAdapter, SocketClientAdapter, TracingRecorder},
//!     core::{MulticastDispatcher, SecondaryTasks},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = interlink::config::load_config("interlink.yaml").await?;
//! let dispatcher = MulticastDispatcher::new(
//!     Arc::new(HttpClientAdapter::with_certificates(&cfg.certificates)?),
//!     Arc::new(SocketClientAdapter::new(cfg.router.max_body_bytes)?),
//!     Arc::new(TracingRecorder),
//!     SecondaryTasks::new(),
//! );
//! let gateway = GatewayService::new(Arc::new(cfg), dispatcher)?;
//! // Hand the gateway to an HttpHandler or SocketListeners (see the binary crate)
//! # let _ = gateway;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! **ports** (traits) are separated from **adapters** (implementations); matching, path
//! rewriting, dispatch and the mediator overlay live in `core` and depend only on the ports.
//!
//! # Error Handling
//! Library seams return domain error types built with `thiserror`; start-up and wiring code
//! returns `eyre::Result<T>` with context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Configuration snapshots are swapped with `arc-swap`; shared mutable maps use
//! `scc::HashMap`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler, SocketClientAdapter, SocketListeners},
    core::{GatewayService, MulticastDispatcher},
    ports::{http_client::HttpClient, socket_client::SocketClient},
    utils::{ConnectionTracker, GracefulShutdown},
};
