//! Distribution counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

/// Counters for publish, listener and delivery activity.
#[derive(Debug)]
pub struct DistributionMetrics {
    /// Messages this process published to the broker.
    published: AtomicU64,
    /// Messages the listener read from the broker.
    received: AtomicU64,
    /// Messages dropped by the listener as already seen.
    duplicates_dropped: AtomicU64,
    /// Payloads queued on a connection.
    deliveries_scheduled: AtomicU64,
    /// Payloads written to a transport.
    deliveries_succeeded: AtomicU64,
    /// Payloads a transport refused.
    deliveries_failed: AtomicU64,
    /// Broker operations that failed.
    broker_errors: AtomicU64,
    /// Delivery tasks aborted at shutdown.
    tasks_cancelled: AtomicU64,
    /// Connections closed because their outbox filled up.
    connections_shed: AtomicU64,
    started_at: Instant,
}

impl DistributionMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            received: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            deliveries_scheduled: AtomicU64::new(0),
            deliveries_succeeded: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            broker_errors: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            connections_shed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scheduled(&self, count: usize) {
        self.deliveries_scheduled
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery_success(&self) {
        self.deliveries_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery_failure(&self) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_broker_error(&self) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self, count: usize) {
        self.tasks_cancelled.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_shed(&self) {
        self.connections_shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped.load(Ordering::Relaxed)
    }

    pub fn deliveries_scheduled(&self) -> u64 {
        self.deliveries_scheduled.load(Ordering::Relaxed)
    }

    pub fn deliveries_succeeded(&self) -> u64 {
        self.deliveries_succeeded.load(Ordering::Relaxed)
    }

    pub fn deliveries_failed(&self) -> u64 {
        self.deliveries_failed.load(Ordering::Relaxed)
    }

    pub fn broker_errors(&self) -> u64 {
        self.broker_errors.load(Ordering::Relaxed)
    }

    pub fn tasks_cancelled(&self) -> u64 {
        self.tasks_cancelled.load(Ordering::Relaxed)
    }

    pub fn connections_shed(&self) -> u64 {
        self.connections_shed.load(Ordering::Relaxed)
    }

    /// Time since the metrics were created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Snapshot as a JSON object.
    pub fn to_json(&self) -> Value {
        json!({
            "published": self.published(),
            "received": self.received(),
            "duplicates_dropped": self.duplicates_dropped(),
            "deliveries_scheduled": self.deliveries_scheduled(),
            "deliveries_succeeded": self.deliveries_succeeded(),
            "deliveries_failed": self.deliveries_failed(),
            "broker_errors": self.broker_errors(),
            "tasks_cancelled": self.tasks_cancelled(),
            "connections_shed": self.connections_shed(),
            "uptime_secs": self.uptime().as_secs(),
        })
    }
}

impl Default for DistributionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
