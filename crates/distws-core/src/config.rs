//! Distribution manager configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default broker channel name.
pub const DEFAULT_CHANNEL: &str = "distws";

/// Default sleep between polls that returned no message, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Default first backoff after a broker failure, in milliseconds.
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;

/// Default backoff ceiling, in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;

/// Default grace period for in-flight deliveries at shutdown, in milliseconds.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Default bound on a single transport close, in milliseconds.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1_000;

/// Default number of message ids remembered for de-duplication.
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

/// Default number of payloads a connection may have waiting before it is shed.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Distribution manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Broker channel this manager subscribes to and publishes on.
    pub channel: String,

    /// Sleep between polls when the broker had nothing to deliver.
    pub poll_interval: Duration,

    /// First listener backoff after a broker failure.
    pub backoff_initial: Duration,

    /// Upper bound for the listener backoff.
    pub backoff_max: Duration,

    /// How long shutdown waits for in-flight deliveries before cancelling them.
    pub shutdown_grace: Duration,

    /// Upper bound on one transport close.
    pub close_timeout: Duration,

    /// Number of recent message ids the listener remembers. Zero disables
    /// de-duplication.
    pub dedup_window: usize,

    /// Payloads a connection may have waiting. A peer that falls further
    /// behind is closed with 1008.
    pub outbox_capacity: usize,
}

impl ManagerConfig {
    /// Create a configuration bound to the given broker channel.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            backoff_initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            dedup_window: DEFAULT_DEDUP_WINDOW,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the listener backoff range.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the transport close timeout.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the de-duplication window.
    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    /// Set the per-connection outbox capacity.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.channel.is_empty() {
            return Err(Error::Config("broker channel must not be empty".to_string()));
        }
        if self.outbox_capacity == 0 {
            return Err(Error::Config("outbox_capacity must be non-zero".to_string()));
        }
        if self.backoff_initial.is_zero() {
            return Err(Error::Config("backoff_initial must be non-zero".to_string()));
        }
        if self.backoff_max < self.backoff_initial {
            return Err(Error::Config(format!(
                "backoff_max ({:?}) is below backoff_initial ({:?})",
                self.backoff_max, self.backoff_initial
            )));
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.channel, DEFAULT_CHANNEL);
        assert_eq!(
            config.shutdown_grace,
            Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS)
        );
        assert_eq!(config.dedup_window, DEFAULT_DEDUP_WINDOW);
        assert_eq!(config.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ManagerConfig::new("rooms")
            .with_poll_interval(Duration::from_millis(1))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(80))
            .with_shutdown_grace(Duration::from_millis(250))
            .with_close_timeout(Duration::from_millis(50))
            .with_dedup_window(0)
            .with_outbox_capacity(8);

        assert_eq!(config.channel, "rooms");
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.backoff_initial, Duration::from_millis(10));
        assert_eq!(config.backoff_max, Duration::from_millis(80));
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.close_timeout, Duration::from_millis(50));
        assert_eq!(config.dedup_window, 0);
        assert_eq!(config.outbox_capacity, 8);
    }

    #[test]
    fn test_validate_rejects_zero_outbox() {
        let config = ManagerConfig::default().with_outbox_capacity(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_channel() {
        let config = ManagerConfig::new("");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = ManagerConfig::default()
            .with_backoff(Duration::from_millis(500), Duration::from_millis(100));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
