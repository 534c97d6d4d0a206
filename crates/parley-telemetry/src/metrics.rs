use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Monotonically increasing counter.
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Traffic counters for one server instance.
///
/// Created when the server starts and handed explicitly to every component
/// that updates it. Reads never block writers.
pub struct ServerMetrics {
    started_at: Instant,
    connections_accepted: Counter,
    messages_sent: Counter,
    messages_received: Counter,
    bytes_sent: Counter,
    bytes_received: Counter,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub uptime: String,
    pub connections_accepted: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started_at: Instant) -> Self {
        Self {
            started_at,
            connections_accepted: Counter::default(),
            messages_sent: Counter::default(),
            messages_received: Counter::default(),
            bytes_sent: Counter::default(),
            bytes_received: Counter::default(),
        }
    }

    /// One raw TCP connection accepted by the listener.
    pub fn record_connection_accepted(&self) {
        self.connections_accepted.increment(1);
    }

    /// One message of `bytes` handed to the socket.
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.increment(1);
        self.bytes_sent.increment(bytes as u64);
    }

    /// One message of `bytes` read from the socket.
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.increment(1);
        self.bytes_received.increment(bytes as u64);
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.get()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.get()
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.get()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.get()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.get()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Uptime as `HH:MM:SS`.
    pub fn formatted_uptime(&self) -> String {
        format_uptime(self.uptime())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.uptime();
        MetricsSnapshot {
            uptime_secs: uptime.as_secs(),
            uptime: format_uptime(uptime),
            connections_accepted: self.connections_accepted(),
            messages_sent: self.messages_sent(),
            messages_received: self.messages_received(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a duration as zero-padded `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
