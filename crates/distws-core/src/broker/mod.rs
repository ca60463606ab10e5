//! Broker clients.
//!
//! The broker is the shared pub/sub transport that keeps every process's
//! local registry in step with global publish activity. [`BrokerClient`] is
//! the capability the distribution manager needs; implementations are picked
//! at construction time.
//!
//! - [`MemoryBroker`] - in-process bus for single-instance deployments and
//!   tests
//! - [`RedisBroker`] - Redis pub/sub (behind the `redis` feature)

mod memory;
#[cfg(feature = "redis")]
mod redis;

use async_trait::async_trait;

use distws_proto::Message;

use crate::error::Result;

pub use memory::{MemoryBroker, MemoryBus};
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Connection to a shared publish/subscribe store.
///
/// Every operation may fail with [`Error::BrokerUnavailable`] when the store
/// cannot be reached.
///
/// [`Error::BrokerUnavailable`]: crate::Error::BrokerUnavailable
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open the session with the store.
    async fn connect(&self) -> Result<()>;

    /// Close the session. Subscriptions are dropped.
    async fn disconnect(&self) -> Result<()>;

    /// Start receiving messages published on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<()>;

    /// Stop receiving messages published on `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Publish a message on `channel`.
    async fn publish(&self, channel: &str, message: &Message) -> Result<()>;

    /// Take the next received message without waiting.
    ///
    /// `Ok(None)` means nothing is available right now.
    async fn poll(&self) -> Result<Option<Message>>;
}
