//! Ingress connection accounting.
//!
//! Every HTTP exchange and socket connection is registered for as long as it is being served.
//! The guard returned by [`ConnectionTracker::track`] unregisters on drop, so a caller that
//! disconnects mid-request is still accounted for. Shutdown uses
//! [`ConnectionTracker::wait_for_drain`] to give in-flight work a bounded chance to finish.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use scc::HashMap;
use tokio::time::sleep;

use crate::metrics;

pub type ConnectionId = u64;

/// One registered ingress connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    /// "http", "https", "tcp" or "tls"
    pub ingress: &'static str,
    pub established_at: Instant,
}

impl ConnectionInfo {
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

/// Unregisters its connection when dropped.
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    info: Arc<ConnectionInfo>,
}

impl ConnectionGuard {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.unregister(self.info.id);
    }
}

#[derive(Clone)]
pub struct ConnectionTracker {
    connections: Arc<HashMap<ConnectionId, Arc<ConnectionInfo>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(HashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a connection for the lifetime of the returned guard.
    pub fn track(&self, remote_addr: SocketAddr, ingress: &'static str) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(ConnectionInfo {
            id,
            remote_addr,
            ingress,
            established_at: Instant::now(),
        });

        let _ = self.connections.insert_sync(id, info.clone());
        metrics::set_active_connections(self.connections.len());
        tracing::debug!(
            connection_id = id,
            %remote_addr,
            ingress,
            total_connections = self.connections.len(),
            "Connection registered"
        );

        ConnectionGuard {
            tracker: self.clone(),
            info,
        }
    }

    fn unregister(&self, connection_id: ConnectionId) {
        if let Some((_, info)) = self.connections.remove_sync(&connection_id) {
            metrics::set_active_connections(self.connections.len());
            tracing::debug!(
                connection_id,
                age_ms = info.age().as_millis() as u64,
                total_connections = self.connections.len(),
                "Connection unregistered"
            );
        }
    }

    pub fn active_connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        self.connections.iter_sync(|_, info| {
            stats.total_connections += 1;
            match info.ingress {
                "http" | "https" => stats.http_connections += 1,
                _ => stats.socket_connections += 1,
            }
            stats.oldest_connection_age = stats.oldest_connection_age.max(info.age());
            true
        });
        stats
    }

    /// Wait until no connection is registered or `timeout` elapses. Returns whether it drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut check_interval = Duration::from_millis(50);

        while start.elapsed() < timeout {
            if self.connections.is_empty() {
                tracing::info!("All ingress connections drained");
                return true;
            }
            tracing::debug!(
                remaining = self.connections.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Waiting for ingress connections to drain"
            );
            sleep(check_interval).await;
            check_interval = (check_interval * 2).min(Duration::from_secs(1));
        }

        tracing::warn!(
            remaining = self.connections.len(),
            ?timeout,
            "Drain timeout exceeded"
        );
        false
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub http_connections: usize,
    pub socket_connections: usize,
    pub oldest_connection_age: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_unregisters_on_drop() {
        let tracker = ConnectionTracker::new();
        let addr: SocketAddr = "127.0.0.1:5001".parse().unwrap();

        let guard = tracker.track(addr, "http");
        assert_eq!(guard.info().remote_addr, addr);
        assert_eq!(tracker.active_connection_count(), 1);

        drop(guard);
        assert_eq!(tracker.active_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_drain() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track("127.0.0.1:6661".parse().unwrap(), "tcp");

        assert!(!tracker.wait_for_drain(Duration::from_millis(60)).await);
        drop(guard);
        assert!(tracker.wait_for_drain(Duration::from_millis(60)).await);
    }

    #[tokio::test]
    async fn test_stats_split_by_ingress() {
        let tracker = ConnectionTracker::new();
        let _a = tracker.track("127.0.0.1:1".parse().unwrap(), "https");
        let _b = tracker.track("127.0.0.1:2".parse().unwrap(), "tls");
        let _c = tracker.track("127.0.0.1:3".parse().unwrap(), "tcp");

        let stats = tracker.stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.http_connections, 1);
        assert_eq!(stats.socket_connections, 2);
    }
}
