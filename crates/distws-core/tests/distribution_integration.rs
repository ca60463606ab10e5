//! Integration tests for cross-process distribution.
//!
//! Each `DistributionManager` stands in for one server process. They share a
//! `MemoryBus`, which plays the external broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use distws_core::proto::{close_codes, encode, Message};
use distws_core::{
    Connection, ConnectionState, DistributionManager, Error, ErrorKind, ManagerConfig, MemoryBus,
    Result, Transport,
};

const CHANNEL: &str = "cluster";

#[derive(Default)]
struct TestTransport {
    sent: Mutex<Vec<Value>>,
    closed_with: Mutex<Option<u16>>,
    delay: Option<Duration>,
}

impl TestTransport {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send(&self, payload: &Value) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().push(payload.clone());
        Ok(())
    }

    async fn close(&self, code: u16) -> Result<()> {
        *self.closed_with.lock() = Some(code);
        Ok(())
    }
}

struct HungTransport;

#[async_trait]
impl Transport for HungTransport {
    async fn send(&self, _payload: &Value) -> Result<()> {
        std::future::pending().await
    }

    async fn close(&self, _code: u16) -> Result<()> {
        std::future::pending().await
    }
}

struct FailingTransport;

#[async_trait]
impl Transport for FailingTransport {
    async fn send(&self, _payload: &Value) -> Result<()> {
        Err(Error::Transport("peer reset".to_string()))
    }

    async fn close(&self, _code: u16) -> Result<()> {
        Err(Error::Transport("peer reset".to_string()))
    }
}

fn config() -> ManagerConfig {
    ManagerConfig::new(CHANNEL)
        .with_poll_interval(Duration::from_millis(1))
        .with_backoff(Duration::from_millis(5), Duration::from_millis(40))
        .with_shutdown_grace(Duration::from_millis(150))
        .with_close_timeout(Duration::from_millis(50))
}

async fn process(bus: &MemoryBus) -> DistributionManager {
    let manager = DistributionManager::new(config(), Box::new(bus.client())).unwrap();
    manager.startup().await.unwrap();
    manager
}

fn connect(manager: &DistributionManager, id: &str) -> (Arc<Connection>, Arc<TestTransport>) {
    let transport = Arc::new(TestTransport::default());
    let connection = manager.new_connection(transport.clone(), id).unwrap();
    (connection, transport)
}

async fn subscribe(manager: &DistributionManager, connection: &Arc<Connection>, pattern: &str) {
    let frame = json!({"type": "subscribe", "topic": pattern, "data": null}).to_string();
    manager.receive(connection, &frame).await.unwrap();
}

async fn publish(manager: &DistributionManager, connection: &Arc<Connection>, topic: &str, data: Value) {
    let frame = json!({"type": "publish", "topic": topic, "data": data}).to_string();
    manager.receive(connection, &frame).await.unwrap();
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Give the listeners time to deliver anything still in flight.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_publish_reaches_subscriber_on_other_process() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let b = process(&bus).await;

    let (c1, c1_tx) = connect(&a, "c1");
    let (_c2, c2_tx) = connect(&a, "c2");
    let (publisher, publisher_tx) = connect(&b, "publisher");
    subscribe(&a, &c1, "chat/xyz").await;

    publish(&b, &publisher, "chat/xyz", json!("hi")).await;

    eventually(|| c1_tx.sent().len() == 1).await;
    settle().await;
    assert_eq!(c1_tx.sent(), vec![json!("hi")]);
    assert!(c2_tx.sent().is_empty());
    assert!(publisher_tx.sent().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_single_level_wildcard() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let (rooms, rooms_tx) = connect(&a, "rooms");
    let (publisher, _) = connect(&a, "publisher");
    subscribe(&a, &rooms, "rooms/+").await;

    publish(&a, &publisher, "rooms/42/users", json!("nested")).await;
    publish(&a, &publisher, "rooms/42", json!("direct")).await;

    eventually(|| rooms_tx.sent().len() == 1).await;
    settle().await;
    assert_eq!(rooms_tx.sent(), vec![json!("direct")]);

    a.shutdown().await;
}

#[tokio::test]
async fn test_multi_level_wildcard_includes_parent() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let (sports, sports_tx) = connect(&a, "sports");
    let (publisher, _) = connect(&a, "publisher");
    subscribe(&a, &sports, "sports/#").await;

    publish(&a, &publisher, "sports", json!(1)).await;
    publish(&a, &publisher, "sports/tennis/live", json!(2)).await;
    publish(&a, &publisher, "weather", json!(3)).await;

    eventually(|| sports_tx.sent().len() == 2).await;
    settle().await;
    assert_eq!(sports_tx.sent(), vec![json!(1), json!(2)]);

    a.shutdown().await;
}

#[tokio::test]
async fn test_untargeted_publish_reaches_everyone() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let b = process(&bus).await;
    let (publisher, publisher_tx) = connect(&a, "p");
    let (_x, x_tx) = connect(&b, "x");

    let frame = json!({"type": "publish", "topic": null, "data": "all"}).to_string();
    a.receive(&publisher, &frame).await.unwrap();

    eventually(|| x_tx.sent().len() == 1 && publisher_tx.sent().len() == 1).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_per_connection_order_under_overlapping_fan_out() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;

    let slow = Arc::new(TestTransport::slow(Duration::from_millis(2)));
    let fast = Arc::new(TestTransport::default());
    let slow_conn = a.new_connection(slow.clone(), "slow").unwrap();
    let fast_conn = a.new_connection(fast.clone(), "fast").unwrap();
    subscribe(&a, &slow_conn, "feed/#").await;
    subscribe(&a, &fast_conn, "feed/+").await;

    // Alternate topic sends and broadcasts so fan-outs overlap on both
    // connections while earlier drains are still writing.
    for i in 0..40 {
        if i % 2 == 0 {
            a.send("feed/items", json!(i)).unwrap();
        } else {
            a.broadcast(json!(i)).unwrap();
        }
    }

    eventually(|| slow.sent().len() == 40 && fast.sent().len() == 40).await;
    let expected: Vec<Value> = (0..40).map(|i| json!(i)).collect();
    assert_eq!(slow.sent(), expected);
    assert_eq!(fast.sent(), expected);

    a.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_only_reaches_connections_present_at_call() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let (_early, early_tx) = connect(&a, "early");

    assert_eq!(a.broadcast(json!("first")).unwrap(), 1);
    let (_late, late_tx) = connect(&a, "late");

    eventually(|| early_tx.sent().len() == 1).await;
    settle().await;
    assert_eq!(early_tx.sent(), vec![json!("first")]);
    assert!(late_tx.sent().is_empty());

    a.shutdown().await;
}

#[tokio::test]
async fn test_failing_peer_does_not_affect_siblings() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    a.new_connection(Arc::new(FailingTransport), "broken").unwrap();
    let (_ok, ok_tx) = connect(&a, "ok");

    assert_eq!(a.broadcast(json!("x")).unwrap(), 2);

    eventually(|| ok_tx.sent().len() == 1).await;
    eventually(|| a.metrics().deliveries_failed() == 1).await;

    a.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_with_hung_peer_is_bounded() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let hung = a.new_connection(Arc::new(HungTransport), "hung").unwrap();
    let (healthy, healthy_tx) = connect(&a, "healthy");

    a.broadcast(json!("bye")).unwrap();
    eventually(|| healthy_tx.sent().len() == 1).await;

    let started = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(2), a.shutdown())
        .await
        .expect("shutdown hung");

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.cancelled, 1);
    assert_eq!(hung.state(), ConnectionState::Closed);
    assert_eq!(healthy.state(), ConnectionState::Closed);
    assert_eq!(*healthy_tx.closed_with.lock(), Some(close_codes::SERVICE_RESTART));
    assert_eq!(a.connection_count(), 0);
    assert_eq!(bus.subscriber_count(CHANNEL), 0);
}

#[tokio::test]
async fn test_listener_recovers_after_broker_outage() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let b = process(&bus).await;
    let (c1, c1_tx) = connect(&a, "c1");
    let (publisher, _) = connect(&b, "publisher");
    subscribe(&a, &c1, "alerts").await;

    bus.set_available(false);
    let frame = json!({"type": "publish", "topic": "alerts", "data": "lost"}).to_string();
    let err = b.receive(&publisher, &frame).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokerUnavailable);
    eventually(|| a.metrics().broker_errors() > 0).await;

    bus.set_available(true);
    publish(&b, &publisher, "alerts", json!("back")).await;

    eventually(|| c1_tx.sent().len() == 1).await;
    assert_eq!(c1_tx.sent(), vec![json!("back")]);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_message_is_delivered_once() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let (_c1, c1_tx) = connect(&a, "c1");

    let wire = encode(&Message::broadcast(json!("dup")).with_id("fixed-id")).unwrap();
    for _ in 0..3 {
        bus.publish_raw(CHANNEL, &wire);
    }

    eventually(|| a.metrics().duplicates_dropped() == 2).await;
    settle().await;
    assert_eq!(c1_tx.sent(), vec![json!("dup")]);

    a.shutdown().await;
}

#[tokio::test]
async fn test_connection_ids_are_per_process() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let b = process(&bus).await;

    connect(&a, "same");
    connect(&b, "same");
    let err = a
        .new_connection(Arc::new(TestTransport::default()), "same")
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateConnection(ref id) if id == "same"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_invalid_pattern_leaves_connection_unmodified() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let (c1, _) = connect(&a, "c1");
    subscribe(&a, &c1, "chat/xyz").await;

    for bad in ["chat/#/more", "chat/x+", ""] {
        let frame = json!({"type": "subscribe", "topic": bad, "data": null}).to_string();
        let err = a.receive(&c1, &frame).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubscriptionPattern, "pattern {:?}", bad);
    }

    let patterns: Vec<String> = c1.subscriptions().iter().map(|p| p.to_string()).collect();
    assert_eq!(patterns, vec!["chat/xyz".to_string()]);
    assert_eq!(a.metrics().published(), 0);

    a.shutdown().await;
}

#[tokio::test]
async fn test_removed_connection_gets_nothing() {
    let bus = MemoryBus::new();
    let a = process(&bus).await;
    let (c1, c1_tx) = connect(&a, "c1");
    subscribe(&a, &c1, "news").await;

    a.remove_connection(&c1);
    a.remove_connection(&c1);
    assert_eq!(c1.state(), ConnectionState::Closed);
    assert_eq!(a.send("news", json!(1)).unwrap(), 0);

    settle().await;
    assert!(c1_tx.sent().is_empty());
    assert!(c1_tx.closed_with.lock().is_none());

    a.shutdown().await;
}
