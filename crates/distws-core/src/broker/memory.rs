//! In-process broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use distws_proto::Message;

use super::BrokerClient;
use crate::error::{Error, Result};

type Inbox = Arc<Mutex<VecDeque<String>>>;

#[derive(Default)]
struct BusInner {
    /// Channel → subscribed client id → that client's inbox.
    subscribers: DashMap<String, HashMap<u64, Inbox>>,
    next_client_id: AtomicU64,
    unavailable: AtomicBool,
}

/// A pub/sub store living inside the current process.
///
/// Cloning the bus yields another handle to the same store. Every
/// [`MemoryBroker`] created from it gets its own inbox, and publishing on a
/// channel copies the serialized message into the inbox of every broker
/// subscribed to that channel, the publisher included.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker client attached to this bus.
    pub fn client(&self) -> MemoryBroker {
        MemoryBroker {
            bus: self.clone(),
            client_id: self.inner.next_client_id.fetch_add(1, Ordering::Relaxed),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            connected: AtomicBool::new(false),
            channels: Mutex::new(HashSet::new()),
        }
    }

    /// Simulate an outage. While unavailable, every broker operation fails.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Whether the bus currently accepts operations.
    pub fn is_available(&self) -> bool {
        !self.inner.unavailable.load(Ordering::SeqCst)
    }

    /// Number of brokers subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .subscribers
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Push a raw wire payload to every subscriber of `channel`.
    ///
    /// Returns the number of inboxes reached.
    pub fn publish_raw(&self, channel: &str, raw: &str) -> usize {
        match self.inner.subscribers.get(channel) {
            Some(subs) => {
                for inbox in subs.values() {
                    inbox.lock().push_back(raw.to_string());
                }
                subs.len()
            }
            None => 0,
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::BrokerUnavailable("in-process bus is down".to_string()))
        }
    }

    fn attach(&self, channel: &str, client_id: u64, inbox: Inbox) {
        self.inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .insert(client_id, inbox);
    }

    fn detach(&self, channel: &str, client_id: u64) {
        let now_empty = match self.inner.subscribers.get_mut(channel) {
            Some(mut subs) => {
                subs.remove(&client_id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.inner
                .subscribers
                .remove_if(channel, |_, subs| subs.is_empty());
        }
    }
}

/// Broker client backed by a [`MemoryBus`].
pub struct MemoryBroker {
    bus: MemoryBus,
    client_id: u64,
    inbox: Inbox,
    connected: AtomicBool,
    channels: Mutex<HashSet<String>>,
}

impl MemoryBroker {
    /// Create a client on a private bus of its own.
    pub fn new() -> Self {
        MemoryBus::new().client()
    }

    /// The bus this client is attached to.
    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    /// Whether `connect` has been called without a matching `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Channels this client is subscribed to.
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().iter().cloned().collect()
    }

    fn check_session(&self) -> Result<()> {
        self.bus.check_available()?;
        if !self.is_connected() {
            return Err(Error::BrokerUnavailable("not connected".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        self.bus.check_available()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let channels: Vec<String> = self.channels.lock().drain().collect();
        for channel in channels {
            self.bus.detach(&channel, self.client_id);
        }
        self.inbox.lock().clear();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.check_session()?;
        if self.channels.lock().insert(channel.to_string()) {
            self.bus.attach(channel, self.client_id, self.inbox.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.check_session()?;
        if self.channels.lock().remove(channel) {
            self.bus.detach(channel, self.client_id);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Message) -> Result<()> {
        self.check_session()?;
        let wire = distws_proto::encode(message)?;
        self.bus.publish_raw(channel, &wire);
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Message>> {
        self.check_session()?;
        let next = self.inbox.lock().pop_front();
        match next {
            Some(wire) => Ok(Some(distws_proto::decode(&wire)?)),
            None => Ok(None),
        }
    }
}
