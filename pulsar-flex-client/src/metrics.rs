//! Metrics collection for the pulsar-flex client

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Client metrics collector
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Producer metrics
    pub messages_sent: AtomicU64,
    pub batches_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub send_retries: AtomicU64,
    pub send_latency_sum: AtomicU64,
    pub send_latency_count: AtomicU64,

    // Session metrics
    pub registrations: AtomicU64,
    pub reconnects: AtomicU64,
    pub reconnect_failures: AtomicU64,

    // Connection metrics
    pub connections_created: AtomicU64,
    pub connections_failed: AtomicU64,
}

impl ClientMetrics {
    /// Record a successful send; a batch counts once in `batches_sent`
    pub fn record_send(&self, message_count: u64, byte_count: u64, batched: bool, latency: Duration) {
        self.messages_sent
            .fetch_add(message_count, Ordering::Relaxed);
        if batched {
            self.batches_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
        self.send_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.send_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send that failed terminally
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_retry(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_failure(&self) {
        self.reconnect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful connection
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connection
    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average send latency in microseconds
    pub fn average_send_latency_us(&self) -> f64 {
        let sum = self.send_latency_sum.load(Ordering::Relaxed);
        let count = self.send_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            average_send_latency_us: self.average_send_latency_us(),
            registrations: self.registrations.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            reconnect_failures: self.reconnect_failures.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub batches_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub send_retries: u64,
    pub average_send_latency_us: f64,
    pub registrations: u64,
    pub reconnects: u64,
    pub reconnect_failures: u64,
    pub connections_created: u64,
    pub connections_failed: u64,
}

/// Timing helper for measuring operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_counts_once() {
        let metrics = ClientMetrics::default();
        metrics.record_send(10, 100, true, Duration::from_micros(40));
        metrics.record_send(1, 5, false, Duration::from_micros(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 11);
        assert_eq!(snapshot.batches_sent, 1);
        assert_eq!(snapshot.bytes_sent, 105);
        assert_eq!(snapshot.average_send_latency_us, 30.0);
    }

    #[test]
    fn test_empty_latency_average() {
        assert_eq!(ClientMetrics::default().average_send_latency_us(), 0.0);
    }
}
