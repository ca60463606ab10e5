//! Server configuration.

use clap::Parser;
use std::time::Duration;

use distws_core::config::{
    DEFAULT_CHANNEL, DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_DEDUP_WINDOW, DEFAULT_OUTBOX_CAPACITY,
    DEFAULT_SHUTDOWN_GRACE_MS,
};
use distws_core::{BrokerClient, ManagerConfig, MemoryBroker, RedisBroker};

use crate::error::Result;

/// Default port for the WebSocket endpoint.
pub const DEFAULT_PORT: u16 = 8080;

/// Environment variable holding the accepted bearer tokens.
pub const TOKENS_ENV: &str = "DISTWS_TOKENS";

/// Command-line arguments for the server.
#[derive(Debug, Parser)]
#[command(name = "distws-server")]
#[command(version, about = "Distributed WebSocket pub/sub server", long_about = None)]
pub struct Args {
    /// Address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Broker channel shared by every server process.
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Redis URL (e.g. redis://127.0.0.1/). Without it the in-process broker
    /// is used and only this process takes part.
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Accepted bearer tokens, `token[:label]` separated by `;`.
    /// Without tokens, authentication is disabled.
    #[arg(long, env = TOKENS_ENV, hide_env_values = true)]
    pub tokens: Option<String>,

    /// Grace period for in-flight deliveries at shutdown, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE_MS)]
    pub shutdown_grace_ms: u64,

    /// Upper bound on closing one client at shutdown, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_CLOSE_TIMEOUT_MS)]
    pub close_timeout_ms: u64,

    /// Number of recent message ids remembered for de-duplication.
    #[arg(long, default_value_t = DEFAULT_DEDUP_WINDOW)]
    pub dedup_window: usize,

    /// Payloads a client may fall behind by before it is disconnected.
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> ServerConfig {
        let manager = ManagerConfig::new(self.channel)
            .with_shutdown_grace(Duration::from_millis(self.shutdown_grace_ms))
            .with_close_timeout(Duration::from_millis(self.close_timeout_ms))
            .with_dedup_window(self.dedup_window)
            .with_outbox_capacity(self.outbox_capacity);

        ServerConfig {
            host: self.host,
            port: self.port,
            redis_url: self.redis_url.filter(|url| !url.is_empty()),
            tokens: self.tokens.filter(|tokens| !tokens.trim().is_empty()),
            manager,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Redis URL. `None` selects the in-process broker.
    pub redis_url: Option<String>,
    /// Token list in `token[:label];...` form. `None` disables authentication.
    pub tokens: Option<String>,
    pub manager: ManagerConfig,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Whether clients must present a token.
    pub fn auth_enabled(&self) -> bool {
        self.tokens.is_some()
    }

    /// Build the broker client selected by this configuration.
    pub fn build_broker(&self) -> Result<Box<dyn BrokerClient>> {
        match &self.redis_url {
            Some(url) => Ok(Box::new(RedisBroker::open(url)?)),
            None => Ok(Box::new(MemoryBroker::new())),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            redis_url: None,
            tokens: None,
            manager: ManagerConfig::default(),
        }
    }
}
