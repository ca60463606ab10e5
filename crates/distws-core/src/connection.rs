//! Locally attached connections.
//!
//! A [`Connection`] wraps an already-accepted transport handle together with
//! its subscription patterns and an outbox. Outgoing payloads are queued in
//! the outbox in call order and written by at most one drain task at a time,
//! which keeps per-connection ordering while different connections are
//! written concurrently.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use distws_proto::{Message, MessageType};

use crate::config::DEFAULT_OUTBOX_CAPACITY;
use crate::error::{Error, Result};
use crate::metrics::DistributionMetrics;
use crate::topic::TopicPattern;

/// Outgoing half of a client transport.
///
/// Accepting the peer and reading inbound frames stay with the host; the
/// distribution layer only writes and closes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one payload to the peer.
    async fn send(&self, payload: &Value) -> Result<()>;

    /// Close the transport with the given close code.
    async fn close(&self, code: u16) -> Result<()>;
}

/// Lifecycle state of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of queueing a payload on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    /// The connection is not open; nothing was queued.
    Rejected,
    /// Queued behind an active drain.
    Queued,
    /// Queued, and the caller must start a drain.
    StartDrain,
    /// The outbox was full. The connection is now `Closing` and the caller
    /// owns finishing the close.
    Full,
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<Arc<Value>>,
    draining: bool,
}

/// A client connection attached to this process.
pub struct Connection {
    id: String,
    transport: Arc<dyn Transport>,
    subscriptions: RwLock<HashSet<TopicPattern>>,
    state: AtomicU8,
    outbox: Mutex<Outbox>,
    outbox_capacity: usize,
    delivered: AtomicU64,
    created_at: Instant,
}

impl Connection {
    /// Wrap an accepted transport.
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            transport,
            subscriptions: RwLock::new(HashSet::new()),
            state: AtomicU8::new(ConnectionState::Open as u8),
            outbox: Mutex::new(Outbox::default()),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            delivered: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Limit the number of payloads waiting behind the one being written.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    /// Connection identity, unique within the process.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Maximum number of payloads the outbox holds.
    pub fn outbox_capacity(&self) -> usize {
        self.outbox_capacity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the connection accepts new deliveries.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Time since the connection was registered.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of payloads successfully written to the transport.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of payloads waiting in the outbox.
    pub fn pending_count(&self) -> usize {
        self.outbox.lock().queue.len()
    }

    /// Add a subscription. Returns false if it was already present.
    pub fn subscribe(&self, pattern: TopicPattern) -> bool {
        self.subscriptions.write().insert(pattern)
    }

    /// Remove a subscription. Returns false if it was not present.
    pub fn unsubscribe(&self, pattern: &str) -> bool {
        self.subscriptions.write().remove(pattern)
    }

    /// Snapshot of the subscription patterns, sorted.
    pub fn subscriptions(&self) -> Vec<TopicPattern> {
        let mut patterns: Vec<TopicPattern> = self.subscriptions.read().iter().cloned().collect();
        patterns.sort();
        patterns
    }

    /// Whether any subscription pattern matches `topic`.
    pub fn is_subscribed_to(&self, topic: &str) -> bool {
        crate::topic::matches_any(topic, self.subscriptions.read().iter())
    }

    /// Apply a subscribe or unsubscribe message to this connection.
    ///
    /// The pattern is validated first; on error the subscription set is left
    /// untouched. Returns whether the set changed.
    pub fn apply_subscription(&self, message: &Message) -> Result<bool> {
        let pattern = message.topic.as_deref().unwrap_or_default();
        match message.kind {
            MessageType::Subscribe => Ok(self.subscribe(TopicPattern::parse(pattern)?)),
            MessageType::Unsubscribe => {
                let pattern = TopicPattern::parse(pattern)?;
                Ok(self.unsubscribe(pattern.as_str()))
            }
            other => Err(Error::InvalidSubscriptionMessage(other.to_string())),
        }
    }

    /// Queue a payload for delivery.
    ///
    /// A peer that lets its outbox fill up is shed: the payload is dropped,
    /// pending payloads are discarded and the connection moves to `Closing`.
    pub(crate) fn enqueue(&self, payload: Arc<Value>) -> Enqueue {
        if !self.is_open() {
            return Enqueue::Rejected;
        }
        {
            let mut outbox = self.outbox.lock();
            if outbox.queue.len() < self.outbox_capacity {
                outbox.queue.push_back(payload);
                return if outbox.draining {
                    Enqueue::Queued
                } else {
                    outbox.draining = true;
                    Enqueue::StartDrain
                };
            }
        }

        if self.begin_close() {
            Enqueue::Full
        } else {
            Enqueue::Rejected
        }
    }

    /// Write queued payloads to the transport until the outbox is empty.
    ///
    /// Only the task that received [`Enqueue::StartDrain`] runs this.
    pub(crate) async fn drain(self: Arc<Self>, metrics: Arc<DistributionMetrics>) {
        loop {
            let next = {
                let mut outbox = self.outbox.lock();
                if !self.is_open() {
                    let dropped = outbox.queue.len();
                    outbox.queue.clear();
                    outbox.draining = false;
                    if dropped > 0 {
                        tracing::debug!(
                            connection_id = %self.id,
                            dropped,
                            "connection no longer open, dropping queued payloads"
                        );
                    }
                    return;
                }
                match outbox.queue.pop_front() {
                    Some(payload) => payload,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };

            match self.transport.send(&next).await {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    metrics.record_delivery_success();
                }
                Err(e) => {
                    metrics.record_delivery_failure();
                    tracing::warn!(
                        connection_id = %self.id,
                        error = %e,
                        "delivery failed"
                    );
                }
            }
        }
    }

    /// Close the transport and move to `Closed`.
    ///
    /// Idempotent: a connection that is already closing or closed is left
    /// alone. The transport close is bounded by `timeout`; the connection ends
    /// up `Closed` whether or not the close succeeded.
    pub async fn close(&self, code: u16, timeout: Duration) -> Result<()> {
        if !self.begin_close() {
            return Ok(());
        }
        self.finish_close(code, timeout).await
    }

    /// Move from `Open` to `Closing` and drop pending payloads. Returns false
    /// if the connection was not open.
    pub(crate) fn begin_close(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            self.clear_outbox();
        }
        won
    }

    /// Close the transport, bounded by `timeout`, and move to `Closed`.
    pub(crate) async fn finish_close(&self, code: u16, timeout: Duration) -> Result<()> {
        let result = match tokio::time::timeout(timeout, self.transport.close(code)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport(format!(
                "close timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        result
    }

    /// Mark the connection closed without touching the transport.
    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.clear_outbox();
    }

    fn clear_outbox(&self) {
        let mut outbox = self.outbox.lock();
        outbox.queue.clear();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("subscriptions", &self.subscriptions.read().len())
            .field("pending", &self.pending_count())
            .finish()
    }
}
