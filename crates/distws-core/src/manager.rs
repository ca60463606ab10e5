//! The distribution manager.
//!
//! [`DistributionManager`] owns one broker session bound to one channel, the
//! local [`ConnectionRegistry`] and the supervised set of delivery tasks. A
//! background listener polls the broker and fans every message out to the
//! matching local connections.
//!
//! Publishes coming from local clients are never delivered directly: they go
//! to the broker and come back through the listener, so every process
//! delivers through the same path.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use distws_proto::{close_codes, Message, MessageType};

use crate::broker::BrokerClient;
use crate::config::ManagerConfig;
use crate::connection::{Connection, Enqueue, Transport};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::DistributionMetrics;
use crate::registry::ConnectionRegistry;
use crate::supervisor::{ShutdownReport, TaskSet};

/// Lifecycle state of a [`DistributionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerState::Created => "created",
            ManagerState::Starting => "starting",
            ManagerState::Started => "started",
            ManagerState::Stopping => "stopping",
            ManagerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides delivery targets and schedules drains. Shared with the listener.
#[derive(Clone)]
struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    tasks: Arc<TaskSet>,
    metrics: Arc<DistributionMetrics>,
    close_timeout: Duration,
}

impl Dispatcher {
    fn send(&self, topic: &str, payload: Value) -> usize {
        self.schedule(self.registry.subscribed_to(topic), payload)
    }

    fn broadcast(&self, payload: Value) -> usize {
        self.schedule(self.registry.all(), payload)
    }

    fn send_msg(&self, message: Message) -> usize {
        if message.kind != MessageType::Publish {
            tracing::debug!(kind = %message.kind, "ignoring non-publish message");
            return 0;
        }
        match message.topic {
            Some(topic) if !topic.is_empty() => self.send(&topic, message.data),
            _ => self.broadcast(message.data),
        }
    }

    /// Queue `payload` on each target in order. Returns the number of
    /// connections that accepted it.
    fn schedule(&self, targets: Vec<Arc<Connection>>, payload: Value) -> usize {
        let payload = Arc::new(payload);
        let mut scheduled = 0;

        for connection in targets {
            if self.enqueue(&connection, payload.clone()) {
                scheduled += 1;
            }
        }

        self.metrics.record_scheduled(scheduled);
        scheduled
    }

    fn enqueue(&self, connection: &Arc<Connection>, payload: Arc<Value>) -> bool {
        match connection.enqueue(payload) {
            Enqueue::Rejected => false,
            Enqueue::Queued => true,
            Enqueue::StartDrain => {
                self.tasks
                    .spawn(connection.clone().drain(self.metrics.clone()));
                true
            }
            Enqueue::Full => {
                self.shed(connection);
                false
            }
        }
    }

    /// Drop a connection whose peer stopped keeping up and close it in the
    /// background.
    fn shed(&self, connection: &Arc<Connection>) {
        self.metrics.record_shed();
        self.registry.remove_entry(connection);
        tracing::warn!(
            connection_id = %connection.id(),
            capacity = connection.outbox_capacity(),
            "outbox full, closing slow connection"
        );

        let connection = connection.clone();
        let timeout = self.close_timeout;
        self.tasks.spawn(async move {
            if let Err(e) = connection
                .finish_close(close_codes::POLICY_VIOLATION, timeout)
                .await
            {
                tracing::debug!(
                    connection_id = %connection.id(),
                    error = %e,
                    "closing slow connection failed"
                );
            }
        });
    }
}

/// Remembers the most recent message ids seen by the listener.
struct SeenIds {
    window: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    fn new(window: usize) -> Self {
        Self {
            window,
            order: VecDeque::with_capacity(window),
            ids: HashSet::with_capacity(window),
        }
    }

    /// Record `id`. Returns false if it is already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.window == 0 {
            return true;
        }
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.window {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

/// Keeps the local connections of one process in step with publish activity
/// across every process sharing the broker channel.
pub struct DistributionManager {
    config: ManagerConfig,
    broker: Arc<dyn BrokerClient>,
    dispatcher: Dispatcher,
    state: Mutex<ManagerState>,
    /// Set under the state lock when shutdown arrives during startup.
    stop_requested: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DistributionManager {
    /// Create a manager that will use `broker` on `config.channel`.
    ///
    /// Nothing is connected until [`startup`](Self::startup).
    pub fn new(config: ManagerConfig, broker: Box<dyn BrokerClient>) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let close_timeout = config.close_timeout;

        Ok(Self {
            config,
            broker: Arc::from(broker),
            dispatcher: Dispatcher {
                registry: Arc::new(ConnectionRegistry::new()),
                tasks: Arc::new(TaskSet::new()),
                metrics: Arc::new(DistributionMetrics::new()),
                close_timeout,
            },
            state: Mutex::new(ManagerState::Created),
            stop_requested: AtomicBool::new(false),
            listener: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The bound broker channel.
    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    /// Name of the broker implementation in use.
    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    /// Distribution counters.
    pub fn metrics(&self) -> &Arc<DistributionMetrics> {
        &self.dispatcher.metrics
    }

    /// The local connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.dispatcher.registry
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.dispatcher.registry.len()
    }

    /// Number of delivery tasks currently tracked.
    pub fn pending_tasks(&self) -> usize {
        self.dispatcher.tasks.len()
    }

    /// Connect the broker, subscribe to the channel and start the listener.
    ///
    /// If the broker cannot be reached the manager stays `Created` and the
    /// error is returned. A shutdown requested while starting is honoured
    /// once the broker session is open: the session is released, the manager
    /// ends `Stopped` and startup fails with `InvalidState`.
    pub async fn startup(&self) -> Result<()> {
        self.transition("start", ManagerState::Created, ManagerState::Starting)?;

        let opened = self.open_broker_session().await;

        let stop = {
            let mut state = self.state.lock();
            if self.stop_requested.load(Ordering::SeqCst) {
                *state = ManagerState::Stopping;
                true
            } else if opened.is_ok() {
                let handle = tokio::spawn(run_listener(
                    self.broker.clone(),
                    self.dispatcher.clone(),
                    self.config.clone(),
                    self.shutdown_tx.subscribe(),
                ));
                *self.listener.lock() = Some(handle);
                *state = ManagerState::Started;
                false
            } else {
                *state = ManagerState::Created;
                false
            }
        };

        if stop {
            if opened.is_ok() {
                self.close_broker_session("startup").await;
            }
            *self.state.lock() = ManagerState::Stopped;
            tracing::info!(
                channel = %self.config.channel,
                "shutdown requested during startup, distribution manager stopped"
            );
            return Err(Error::InvalidState {
                operation: "start",
                state: ManagerState::Stopped.as_str(),
            });
        }

        if let Err(e) = opened {
            tracing::error!(
                broker = self.broker.name(),
                channel = %self.config.channel,
                error = %e,
                "failed to start distribution manager"
            );
            return Err(e);
        }

        tracing::info!(
            broker = self.broker.name(),
            channel = %self.config.channel,
            "distribution manager started"
        );
        Ok(())
    }

    async fn open_broker_session(&self) -> Result<()> {
        self.broker.connect().await?;
        if let Err(e) = self.broker.subscribe(&self.config.channel).await {
            if let Err(disconnect_err) = self.broker.disconnect().await {
                tracing::debug!(error = %disconnect_err, "broker disconnect after failed subscribe");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn close_broker_session(&self, during: &'static str) {
        if let Err(e) = self.broker.unsubscribe(&self.config.channel).await {
            tracing::warn!(error = %e, during, "broker unsubscribe failed");
        }
        if let Err(e) = self.broker.disconnect().await {
            tracing::warn!(error = %e, during, "broker disconnect failed");
        }
    }

    /// Stop the listener, settle in-flight deliveries, close every
    /// connection and release the broker session.
    ///
    /// Deliveries get `shutdown_grace` to finish before they are cancelled.
    /// Calling this on a stopped manager does nothing. Called while the
    /// manager is starting, it asks the pending startup to stop instead.
    pub async fn shutdown(&self) -> ShutdownReport {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                ManagerState::Stopped | ManagerState::Stopping => return ShutdownReport::default(),
                ManagerState::Starting => {
                    self.stop_requested.store(true, Ordering::SeqCst);
                    tracing::info!("shutdown requested while starting, startup will stop");
                    return ShutdownReport::default();
                }
                ManagerState::Created => *state = ManagerState::Stopped,
                ManagerState::Started => *state = ManagerState::Stopping,
            }
            previous
        };
        if previous == ManagerState::Created {
            return ShutdownReport::default();
        }

        tracing::info!(channel = %self.config.channel, "stopping distribution manager");

        // Listener first, so no new fan-out is scheduled.
        let _ = self.shutdown_tx.send(());
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "listener panicked");
                }
            }
        }

        let report = self.dispatcher.tasks.shutdown(self.config.shutdown_grace).await;
        self.dispatcher.metrics.record_cancelled(report.cancelled);
        if report.cancelled > 0 {
            tracing::warn!(
                cancelled = report.cancelled,
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "cancelled deliveries still running after grace period"
            );
        }

        let connections = self.dispatcher.registry.all();
        let closing = connections
            .iter()
            .map(|connection| self.close_connection(connection, close_codes::SERVICE_RESTART));
        futures::future::join_all(closing).await;

        self.close_broker_session("shutdown").await;

        *self.state.lock() = ManagerState::Stopped;

        let metrics = &self.dispatcher.metrics;
        tracing::info!(
            published = metrics.published(),
            received = metrics.received(),
            duplicates_dropped = metrics.duplicates_dropped(),
            deliveries_succeeded = metrics.deliveries_succeeded(),
            deliveries_failed = metrics.deliveries_failed(),
            broker_errors = metrics.broker_errors(),
            tasks_completed = report.completed,
            tasks_cancelled = report.cancelled,
            connections_closed = connections.len(),
            uptime_secs = metrics.uptime().as_secs(),
            "distribution manager stopped"
        );

        report
    }

    /// Register an accepted transport under `id`.
    pub fn new_connection(
        &self,
        transport: Arc<dyn Transport>,
        id: impl Into<String>,
    ) -> Result<Arc<Connection>> {
        self.ensure_started("register a connection")?;
        let connection = Arc::new(
            Connection::new(id, transport).with_outbox_capacity(self.config.outbox_capacity),
        );
        self.dispatcher.registry.add(connection.clone())?;
        tracing::debug!(connection_id = %connection.id(), "connection registered");
        Ok(connection)
    }

    /// Close the transport with `code` and drop the connection from the
    /// registry.
    ///
    /// Close failures are logged, not returned. Calling this again is a no-op.
    pub async fn close_connection(&self, connection: &Arc<Connection>, code: u16) {
        if let Err(e) = connection.close(code, self.config.close_timeout).await {
            tracing::warn!(
                connection_id = %connection.id(),
                code,
                error = %e,
                "closing connection failed"
            );
        }
        if self.dispatcher.registry.remove_entry(connection) {
            tracing::debug!(connection_id = %connection.id(), code, "connection closed");
        }
    }

    /// Drop a connection whose transport is already gone.
    pub fn remove_connection(&self, connection: &Arc<Connection>) {
        connection.mark_closed();
        if self.dispatcher.registry.remove_entry(connection) {
            tracing::debug!(connection_id = %connection.id(), "connection removed");
        }
    }

    /// Deliver `payload` to every local connection subscribed to `topic`.
    ///
    /// Returns the number of connections the payload was queued on. Delivery
    /// itself happens in the background.
    pub fn send(&self, topic: &str, payload: Value) -> Result<usize> {
        self.ensure_started("send")?;
        Ok(self.dispatcher.send(topic, payload))
    }

    /// Deliver `payload` to every local connection.
    pub fn broadcast(&self, payload: Value) -> Result<usize> {
        self.ensure_started("broadcast")?;
        Ok(self.dispatcher.broadcast(payload))
    }

    /// Deliver a publish message locally: to its topic's subscribers, or to
    /// everyone when it has no topic.
    pub fn send_msg(&self, message: Message) -> Result<usize> {
        self.ensure_started("send")?;
        Ok(self.dispatcher.send_msg(message))
    }

    /// Queue `payload` for a single connection, behind anything already
    /// queued for it.
    pub fn reply(&self, connection: &Arc<Connection>, payload: Value) -> Result<()> {
        self.ensure_started("reply")?;
        if self.dispatcher.enqueue(connection, Arc::new(payload)) {
            self.dispatcher.metrics.record_scheduled(1);
            Ok(())
        } else {
            Err(Error::ConnectionClosed(connection.id().to_string()))
        }
    }

    /// Publish a message on the broker channel for every process to deliver.
    ///
    /// The message is stamped with a fresh id for de-duplication.
    pub async fn publish(&self, message: Message) -> Result<()> {
        self.ensure_started("publish")?;
        if message.kind != MessageType::Publish {
            return Err(Error::Protocol(distws_proto::Error::InvalidMessage(format!(
                "cannot publish a {} message",
                message.kind
            ))));
        }

        let message = message.with_id(Uuid::new_v4().to_string());
        if let Err(e) = self.broker.publish(&self.config.channel, &message).await {
            self.dispatcher.metrics.record_broker_error();
            return Err(e);
        }
        self.dispatcher.metrics.record_published();
        Ok(())
    }

    /// Handle one raw inbound frame from `connection`.
    ///
    /// Subscribe and unsubscribe frames change the connection's patterns and
    /// stay local. Publish frames go to the broker.
    pub async fn receive(&self, connection: &Arc<Connection>, raw: &str) -> Result<()> {
        self.ensure_started("receive")?;
        if !connection.is_open() {
            return Err(Error::ConnectionClosed(connection.id().to_string()));
        }

        let message = distws_proto::decode(raw)?;
        if message.kind.is_subscription() {
            let changed = connection.apply_subscription(&message)?;
            tracing::debug!(
                connection_id = %connection.id(),
                kind = %message.kind,
                pattern = message.topic.as_deref().unwrap_or_default(),
                changed,
                "subscription updated"
            );
            return Ok(());
        }

        self.publish(message).await
    }

    fn ensure_started(&self, operation: &'static str) -> Result<()> {
        let state = *self.state.lock();
        if state == ManagerState::Started {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: state.as_str(),
            })
        }
    }

    fn transition(
        &self,
        operation: &'static str,
        from: ManagerState,
        to: ManagerState,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(Error::InvalidState {
                operation,
                state: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }
}

impl Drop for DistributionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for DistributionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributionManager")
            .field("channel", &self.config.channel)
            .field("broker", &self.broker.name())
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn run_listener(
    broker: Arc<dyn BrokerClient>,
    dispatcher: Dispatcher,
    config: ManagerConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let metrics = dispatcher.metrics.clone();
    let mut seen = SeenIds::new(config.dedup_window);
    let mut backoff = config.backoff_initial;

    tracing::debug!(channel = %config.channel, "listener running");

    loop {
        let polled = tokio::select! {
            _ = shutdown.recv() => break,
            polled = broker.poll() => polled,
        };

        match polled {
            Ok(Some(message)) => {
                backoff = config.backoff_initial;
                metrics.record_received();

                if let Some(id) = message.id.as_deref() {
                    if !seen.insert(id) {
                        metrics.record_duplicate();
                        tracing::debug!(message_id = id, "dropping duplicate message");
                        continue;
                    }
                }

                dispatcher.send_msg(message);
                tokio::task::yield_now().await;
            }
            Ok(None) => {
                backoff = config.backoff_initial;
                if !pause(config.poll_interval, &mut shutdown).await {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Protocol => {
                tracing::warn!(error = %e, "skipping malformed broker message");
            }
            Err(e) => {
                metrics.record_broker_error();
                tracing::warn!(
                    broker = broker.name(),
                    error = %e,
                    retry_ms = backoff.as_millis() as u64,
                    "broker poll failed, backing off"
                );
                if !pause(backoff, &mut shutdown).await {
                    break;
                }
                backoff = (backoff * 2).min(config.backoff_max);
            }
        }
    }

    tracing::debug!(channel = %config.channel, "listener stopped");
}

/// Sleep for `duration` unless shutdown is signalled first. Returns false on
/// shutdown.
async fn pause(duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown.recv() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
