//! distws core - distribution manager, topic matching and broker clients.
//!
//! Many server processes, each holding its own set of WebSocket connections,
//! share one broker channel. Every process keeps a local registry of
//! connections tagged with topic patterns and relays publishes through the
//! broker, so a client on one process receives what a client on another
//! process published.
//!
//! # Modules
//!
//! - [`topic`] - Hierarchical topic patterns with `+` and `#` wildcards
//! - [`connection`] - Connections, the transport capability and per-connection ordering
//! - [`registry`] - Local connection registry
//! - [`broker`] - Broker capability with in-process and Redis clients
//! - [`manager`] - The distribution manager and its listener
//! - [`supervisor`] - Supervised delivery tasks
//! - [`config`] - Manager configuration
//! - [`metrics`] - Distribution counters

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod supervisor;
pub mod topic;

pub use broker::{BrokerClient, MemoryBroker, MemoryBus};
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
pub use config::ManagerConfig;
pub use connection::{Connection, ConnectionState, Transport};
pub use error::{Error, ErrorKind, Result};
pub use manager::{DistributionManager, ManagerState};
pub use metrics::DistributionMetrics;
pub use registry::ConnectionRegistry;
pub use supervisor::{ShutdownReport, TaskSet};
pub use topic::TopicPattern;

/// Re-export protocol types.
pub use distws_proto as proto;
