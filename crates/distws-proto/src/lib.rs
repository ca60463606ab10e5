//! distws wire protocol.
//!
//! This crate defines the message format shared by clients, the distribution
//! manager and the broker channel. Messages travel as JSON objects:
//!
//! ```text
//! {"type": "publish", "topic": "chat/xyz", "data": "hi"}
//! {"type": "subscribe", "topic": "rooms/+", "data": null}
//! {"type": "publish", "topic": null, "data": {"notice": "maintenance"}}
//! ```
//!
//! # Modules
//!
//! - [`message`] - Message types and the JSON codec
//! - [`error`] - Protocol error types

pub mod error;
pub mod message;

pub use error::Error;
pub use message::{close_codes, decode, encode, Message, MessageType};

/// Protocol version for wire compatibility.
///
/// Bump this when the JSON shape of [`Message`] changes in a way older
/// processes sharing the same broker channel cannot read.
pub const PROTOCOL_VERSION: u32 = 1;
