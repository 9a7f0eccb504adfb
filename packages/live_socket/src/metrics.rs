//! Engine metrics for observability
//!
//! Counters are bumped from socket loops, the hub and the pub/sub bridge and
//! read through a serializable snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Engine-wide metrics
#[derive(Debug, Default)]
pub struct LiveMetrics {
    // Socket lifecycle
    /// Sockets currently Active
    pub active_sockets: AtomicU64,
    /// Successful mounts since start
    pub mounts: AtomicU64,
    /// Connection attempts refused by mount
    pub mount_failures: AtomicU64,

    // Dispatch
    /// Client events handled successfully
    pub events_handled: AtomicU64,
    /// Self messages handled successfully
    pub self_messages_handled: AtomicU64,
    /// Events or self messages with no registered handler
    pub unknown_messages: AtomicU64,
    /// Handler invocations that returned an error
    pub handler_errors: AtomicU64,
    /// Render invocations that failed
    pub render_errors: AtomicU64,

    // Fan-out
    /// Broadcasts accepted by the hub
    pub broadcasts: AtomicU64,
    /// Self messages enqueued by broadcasts. Counted at enqueue time, so a
    /// message queued for a socket whose mount then fails still counts.
    pub deliveries: AtomicU64,
    /// Targets skipped because they were no longer registered
    pub skipped_deliveries: AtomicU64,
    /// External pub/sub messages that failed to decode
    pub decode_failures: AtomicU64,

    // Storage
    /// Session loads and saves that failed
    pub storage_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn socket_mounted(&self) {
        self.mounts.fetch_add(1, Ordering::Relaxed);
        self.active_sockets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_closed(&self) {
        self.active_sockets.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn mount_failed(&self) {
        self.mount_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_handled(&self) {
        self.events_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn self_message_handled(&self) {
        self.self_messages_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_message(&self) {
        self.unknown_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_error(&self) {
        self.render_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast(&self, delivered: usize, skipped: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.skipped_deliveries
            .fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sockets: SocketMetrics {
                active: self.active_sockets.load(Ordering::Relaxed),
                mounts: self.mounts.load(Ordering::Relaxed),
                mount_failures: self.mount_failures.load(Ordering::Relaxed),
            },
            dispatch: DispatchMetrics {
                events_handled: self.events_handled.load(Ordering::Relaxed),
                self_messages_handled: self.self_messages_handled.load(Ordering::Relaxed),
                unknown_messages: self.unknown_messages.load(Ordering::Relaxed),
                handler_errors: self.handler_errors.load(Ordering::Relaxed),
                render_errors: self.render_errors.load(Ordering::Relaxed),
            },
            fanout: FanoutMetrics {
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
                deliveries: self.deliveries.load(Ordering::Relaxed),
                skipped_deliveries: self.skipped_deliveries.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
            },
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sockets: SocketMetrics,
    pub dispatch: DispatchMetrics,
    pub fanout: FanoutMetrics,
    pub storage_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketMetrics {
    pub active: u64,
    pub mounts: u64,
    pub mount_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMetrics {
    pub events_handled: u64,
    pub self_messages_handled: u64,
    pub unknown_messages: u64,
    pub handler_errors: u64,
    pub render_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutMetrics {
    pub broadcasts: u64,
    pub deliveries: u64,
    pub skipped_deliveries: u64,
    pub decode_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_tracking() {
        let metrics = LiveMetrics::new();

        metrics.socket_mounted();
        metrics.socket_mounted();
        assert_eq!(metrics.active_sockets.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.mounts.load(Ordering::Relaxed), 2);

        metrics.socket_closed();
        assert_eq!(metrics.active_sockets.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.mounts.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_broadcast_tracking() {
        let metrics = LiveMetrics::new();
        metrics.broadcast(3, 1);
        metrics.broadcast(2, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fanout.broadcasts, 2);
        assert_eq!(snapshot.fanout.deliveries, 5);
        assert_eq!(snapshot.fanout.skipped_deliveries, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = LiveMetrics::new();
        metrics.unknown_message();
        metrics.decode_failure();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["dispatch"]["unknown_messages"], 1);
        assert_eq!(json["fanout"]["decode_failures"], 1);
    }
}
