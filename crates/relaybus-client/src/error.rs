//! Client error types.

use std::time::Duration;

use relaybus_proto::{AckError, ProtocolError, ResolveError};
use relaybus_transport::TransportError;

use crate::config::ConfigurationError;

/// Errors surfaced by the client session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A command acknowledgement went wrong
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// No message was available; transient, retry after the backoff
    #[error("no message received; retry in {backoff:?}")]
    MessageNotReceived {
        /// Suggested retry backoff.
        backoff: Duration,
    },
    /// The session is not connected
    #[error("not connected to the broker")]
    NotConnected,
    /// Malformed inbound frames
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Topic resolution failed
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Missing or malformed configuration
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Why a command acknowledgement was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The acknowledgement did not match the issued command
    #[error(transparent)]
    Ack(#[from] AckError),
    /// No acknowledgement arrived within the ack timeout
    #[error("timed out waiting for acknowledgement of command {id}")]
    Timeout {
        /// The command id that went unacknowledged.
        id: String,
    },
    /// The link closed while waiting for the acknowledgement
    #[error("connection closed while awaiting acknowledgement")]
    ConnectionClosed,
    /// The acknowledgement frames were malformed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
