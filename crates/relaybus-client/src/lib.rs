//! # relaybus Client
//!
//! Client session library for the relaybus pub/sub protocol.
//!
//! A [`ClientSession`] owns one DEALER-style connection to the broker and
//! provides:
//! - connect/disconnect with a CONNECT handshake and acknowledgement
//! - subscribe/unsubscribe, acknowledged before the local list changes
//! - fire-and-forget publish with per-target fan-out for direct requests
//! - a blocking `receive` that skips keepalives
//! - two background heartbeat monitors that keep the connection warm and
//!   reconnect (replaying subscriptions) when the broker goes quiet

pub mod config;
pub mod error;
mod heartbeat;
pub mod session;

pub use config::{ClientConfig, ConfigurationError};
pub use error::{ClientError, HandshakeError};
pub use session::ClientSession;
