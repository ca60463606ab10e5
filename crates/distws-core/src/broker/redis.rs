//! Redis pub/sub broker.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;

use distws_proto::Message;

use super::BrokerClient;
use crate::error::{Error, Result};

enum Incoming {
    Message(Message),
    /// The subscription stream for a channel ended.
    Lost(String),
}

/// Broker client backed by Redis PUBLISH/SUBSCRIBE.
///
/// Publishing goes through a reconnecting [`ConnectionManager`]. Each
/// subscribed channel gets its own pub/sub connection and a forwarder task
/// that decodes payloads into a local queue, which [`BrokerClient::poll`]
/// drains without blocking. When a subscription stream ends, the next poll
/// reports the broker as unavailable and later polls try to subscribe again.
///
/// The local queue is replaced on disconnect, so nothing received in one
/// session is handed out in the next.
pub struct RedisBroker {
    client: ::redis::Client,
    publisher: Mutex<Option<ConnectionManager>>,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
    lost: Mutex<HashSet<String>>,
    incoming_tx: Mutex<mpsc::UnboundedSender<Incoming>>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Incoming>>,
}

impl RedisBroker {
    /// Create a client for the Redis server at `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// No connection is made until [`BrokerClient::connect`].
    pub fn open(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid redis url {:?}: {}", url, e)))?;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        Ok(Self {
            client,
            publisher: Mutex::new(None),
            forwarders: Mutex::new(HashMap::new()),
            lost: Mutex::new(HashSet::new()),
            incoming_tx: Mutex::new(incoming_tx),
            incoming_rx: Mutex::new(incoming_rx),
        })
    }

    fn publisher(&self) -> Result<ConnectionManager> {
        self.publisher
            .lock()
            .clone()
            .ok_or_else(|| Error::BrokerUnavailable("not connected".to_string()))
    }

    async fn open_subscription(&self, channel: &str) -> Result<JoinHandle<()>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.subscribe(channel).await.map_err(unavailable)?;

        let tx = self.incoming_tx.lock().clone();
        let channel = channel.to_string();

        Ok(tokio::spawn(async move {
            let log_channel = channel.clone();
            let payloads = pubsub.into_on_message().filter_map(move |msg| {
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %log_channel, error = %e, "unreadable broker payload");
                        None
                    }
                };
                futures::future::ready(payload)
            });
            forward(channel, payloads, tx).await;
        }))
    }

    /// Take the next queued item, turning a lost subscription into an error
    /// and remembering the channel for resubscription.
    fn next_incoming(&self) -> Result<Option<Message>> {
        let next = self.incoming_rx.lock().try_recv();
        match next {
            Ok(Incoming::Message(message)) => Ok(Some(message)),
            Ok(Incoming::Lost(channel)) => {
                if self.forwarders.lock().remove(&channel).is_none() {
                    // Unsubscribed while the forwarder was winding down.
                    return Ok(None);
                }
                self.lost.lock().insert(channel.clone());
                Err(Error::BrokerUnavailable(format!(
                    "subscription to {} lost",
                    channel
                )))
            }
            Err(_) => Ok(None),
        }
    }

    /// Swap in a fresh queue. Forwarders still holding the old sender fail
    /// their next send and stop.
    fn reset_incoming(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.incoming_tx.lock() = tx;
        *self.incoming_rx.lock() = rx;
    }

    async fn resubscribe_lost(&self) -> Result<()> {
        let lost: Vec<String> = self.lost.lock().drain().collect();
        let mut first_error = None;

        for channel in lost {
            match self.open_subscription(&channel).await {
                Ok(handle) => {
                    tracing::info!(channel = %channel, "redis subscription restored");
                    self.forwarders.lock().insert(channel, handle);
                }
                Err(e) => {
                    self.lost.lock().insert(channel);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn unavailable(e: ::redis::RedisError) -> Error {
    Error::BrokerUnavailable(e.to_string())
}

/// Decode raw payloads from one channel into the local queue until the
/// stream ends, then report the channel as lost.
async fn forward<S>(channel: String, payloads: S, tx: mpsc::UnboundedSender<Incoming>)
where
    S: Stream<Item = String>,
{
    let mut payloads = std::pin::pin!(payloads);
    while let Some(payload) = payloads.next().await {
        match distws_proto::decode(&payload) {
            Ok(message) => {
                if tx.send(Incoming::Message(message)).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "dropping undecodable broker payload");
            }
        }
    }
    tracing::warn!(channel = %channel, "redis subscription stream ended");
    let _ = tx.send(Incoming::Lost(channel));
}

#[async_trait]
impl BrokerClient for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<()> {
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(unavailable)?;
        *self.publisher.lock() = Some(manager);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for (_, handle) in self.forwarders.lock().drain() {
            handle.abort();
        }
        self.lost.lock().clear();
        self.reset_incoming();
        *self.publisher.lock() = None;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.publisher()?;
        if self.forwarders.lock().contains_key(channel) {
            return Ok(());
        }
        let handle = self.open_subscription(channel).await?;
        if let Some(previous) = self.forwarders.lock().insert(channel.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if let Some(handle) = self.forwarders.lock().remove(channel) {
            handle.abort();
        }
        self.lost.lock().remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Message) -> Result<()> {
        let mut conn = self.publisher()?;
        let wire = distws_proto::encode(message)?;
        let _receivers: i64 = conn.publish(channel, wire).await.map_err(unavailable)?;
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Message>> {
        self.publisher()?;
        if !self.lost.lock().is_empty() {
            self.resubscribe_lost().await?;
        }

        self.next_incoming()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_rejects_bad_url() {
        let result = RedisBroker::open("definitely not a url");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_operations_before_connect() {
        let broker = RedisBroker::open("redis://127.0.0.1:6379/").unwrap();
        assert_eq!(broker.name(), "redis");

        let publish = broker.publish("ch", &Message::broadcast(json!(1))).await;
        assert!(matches!(publish, Err(Error::BrokerUnavailable(_))));
        assert!(matches!(broker.poll().await, Err(Error::BrokerUnavailable(_))));
        assert!(matches!(
            broker.subscribe("ch").await,
            Err(Error::BrokerUnavailable(_))
        ));
    }

    fn offline_broker() -> RedisBroker {
        // Nothing listens on port 1.
        RedisBroker::open("redis://127.0.0.1:1/").unwrap()
    }

    fn wire(message: &Message) -> String {
        distws_proto::encode(message).unwrap()
    }

    #[tokio::test]
    async fn test_forward_decodes_and_skips_garbage() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let payloads = futures::stream::iter(vec![
            wire(&Message::publish("rooms/1", json!("a")).with_id("m-1")),
            "{not json".to_string(),
            wire(&Message::broadcast(json!("b"))),
        ]);

        forward("ch".to_string(), payloads, tx).await;

        match rx.try_recv() {
            Ok(Incoming::Message(message)) => {
                assert_eq!(message.topic.as_deref(), Some("rooms/1"));
                assert_eq!(message.id.as_deref(), Some("m-1"));
            }
            _ => panic!("expected the first message"),
        }
        match rx.try_recv() {
            Ok(Incoming::Message(message)) => assert_eq!(message.data, json!("b")),
            _ => panic!("expected the second message"),
        }
        match rx.try_recv() {
            Ok(Incoming::Lost(channel)) => assert_eq!(channel, "ch"),
            _ => panic!("expected the stream end to be reported"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_subscription_is_reported_once_and_queued_for_retry() {
        let broker = offline_broker();
        broker
            .forwarders
            .lock()
            .insert("ch".to_string(), tokio::spawn(async {}));

        let tx = broker.incoming_tx.lock().clone();
        tx.send(Incoming::Lost("ch".to_string())).unwrap();
        tx.send(Incoming::Message(Message::broadcast(json!("later"))))
            .unwrap();

        assert!(matches!(
            broker.next_incoming(),
            Err(Error::BrokerUnavailable(_))
        ));
        assert!(broker.lost.lock().contains("ch"));
        assert!(!broker.forwarders.lock().contains_key("ch"));

        // Messages queued behind the loss still come through.
        let next = broker.next_incoming().unwrap().unwrap();
        assert_eq!(next.data, json!("later"));
        assert!(broker.next_incoming().unwrap().is_none());

        // The server is unreachable, so the channel stays queued for retry.
        assert!(matches!(
            broker.resubscribe_lost().await,
            Err(Error::BrokerUnavailable(_))
        ));
        assert!(broker.lost.lock().contains("ch"));
    }

    #[tokio::test]
    async fn test_loss_after_unsubscribe_is_ignored() {
        let broker = offline_broker();
        let tx = broker.incoming_tx.lock().clone();
        tx.send(Incoming::Lost("gone".to_string())).unwrap();

        assert!(broker.next_incoming().unwrap().is_none());
        assert!(broker.lost.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_discards_previous_session() {
        let broker = offline_broker();
        let stale = broker.incoming_tx.lock().clone();
        stale
            .send(Incoming::Message(Message::broadcast(json!("queued"))))
            .unwrap();

        broker.disconnect().await.unwrap();
        assert!(broker.next_incoming().unwrap().is_none());

        // A forwarder from the old session can no longer reach the queue.
        assert!(stale
            .send(Incoming::Message(Message::broadcast(json!("late"))))
            .is_err());
        assert!(broker.next_incoming().unwrap().is_none());
    }

    async fn poll_until_message(broker: &RedisBroker) -> Message {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            assert!(std::time::Instant::now() < deadline, "no message from redis");
            if let Some(message) = broker.poll().await.unwrap() {
                return message;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_live_round_trip_and_resubscribe() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let channel = format!("distws-test-{}", uuid::Uuid::new_v4());
        let broker = RedisBroker::open(&url).unwrap();
        broker.connect().await.unwrap();
        broker.subscribe(&channel).await.unwrap();

        broker
            .publish(&channel, &Message::broadcast(json!("first")).with_id("r-1"))
            .await
            .unwrap();
        let message = poll_until_message(&broker).await;
        assert_eq!(message.data, json!("first"));
        assert_eq!(message.id.as_deref(), Some("r-1"));

        // Drop the subscription stream the way a server restart would.
        if let Some(handle) = broker.forwarders.lock().get(&channel) {
            handle.abort();
        }
        let tx = broker.incoming_tx.lock().clone();
        tx.send(Incoming::Lost(channel.clone())).unwrap();

        assert!(matches!(
            broker.poll().await,
            Err(Error::BrokerUnavailable(_))
        ));

        // The next poll resubscribes.
        assert!(broker.poll().await.unwrap().is_none());
        assert!(broker.lost.lock().is_empty());
        assert!(broker.forwarders.lock().contains_key(&channel));

        broker
            .publish(&channel, &Message::broadcast(json!("second")))
            .await
            .unwrap();
        let message = poll_until_message(&broker).await;
        assert_eq!(message.data, json!("second"));

        broker.unsubscribe(&channel).await.unwrap();
        broker.disconnect().await.unwrap();
    }
}
