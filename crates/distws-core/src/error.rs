//! Core error types.

use thiserror::Error;

/// Distribution errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A connection with this identity is already registered.
    #[error("duplicate connection: {0}")]
    DuplicateConnection(String),

    /// A subscribe/unsubscribe message carried a malformed topic pattern.
    #[error("invalid subscription pattern {pattern:?}: {reason}")]
    InvalidSubscriptionPattern {
        /// The rejected pattern.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A subscription mutation was requested with a non-subscription message.
    #[error("invalid subscription message: expected subscribe or unsubscribe, got {0}")]
    InvalidSubscriptionMessage(String),

    /// The broker could not be reached or rejected the operation.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The connection is closing or closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The connection transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The manager is not in a state that allows the operation.
    #[error("cannot {operation} while manager is {state}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The manager state at the time.
        state: &'static str,
    },

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] distws_proto::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Error category for dispatching without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateConnection,
    InvalidSubscriptionPattern,
    InvalidSubscriptionMessage,
    BrokerUnavailable,
    ConnectionClosed,
    Transport,
    InvalidState,
    Protocol,
    Config,
}

impl ErrorKind {
    /// Stable snake_case name, suitable for client-facing error frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DuplicateConnection => "duplicate_connection",
            ErrorKind::InvalidSubscriptionPattern => "invalid_subscription_pattern",
            ErrorKind::InvalidSubscriptionMessage => "invalid_subscription_message",
            ErrorKind::BrokerUnavailable => "broker_unavailable",
            ErrorKind::ConnectionClosed => "connection_closed",
            ErrorKind::Transport => "transport",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Config => "config",
        }
    }

    /// Whether the error stems from bad client input rather than a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidSubscriptionPattern
                | ErrorKind::InvalidSubscriptionMessage
                | ErrorKind::Protocol
        )
    }
}

impl Error {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateConnection(_) => ErrorKind::DuplicateConnection,
            Error::InvalidSubscriptionPattern { .. } => ErrorKind::InvalidSubscriptionPattern,
            Error::InvalidSubscriptionMessage(_) => ErrorKind::InvalidSubscriptionMessage,
            Error::BrokerUnavailable(_) => ErrorKind::BrokerUnavailable,
            Error::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            Error::Transport(_) => ErrorKind::Transport,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Error::InvalidSubscriptionPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::DuplicateConnection("c1".into()).kind(),
            ErrorKind::DuplicateConnection
        );
        assert_eq!(
            Error::invalid_pattern("a/#/b", "bad").kind(),
            ErrorKind::InvalidSubscriptionPattern
        );
        assert_eq!(
            Error::Protocol(distws_proto::Error::InvalidMessage("x".into())).kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_client_errors() {
        assert!(ErrorKind::InvalidSubscriptionPattern.is_client_error());
        assert!(ErrorKind::Protocol.is_client_error());
        assert!(!ErrorKind::BrokerUnavailable.is_client_error());
        assert!(!ErrorKind::DuplicateConnection.is_client_error());
    }

    #[test]
    fn test_display() {
        let err = Error::InvalidState {
            operation: "send",
            state: "stopped",
        };
        assert_eq!(err.to_string(), "cannot send while manager is stopped");
    }
}
