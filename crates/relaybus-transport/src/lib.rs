//! # relaybus Transport
//!
//! The router-addressed multipart socket abstraction both relaybus roles
//! talk through: clients hold a DEALER-style [`Link`], the broker holds a
//! ROUTER-style [`RouterBinding`] that sees a sender identity on every
//! inbound message and addresses outbound messages by identity.
//!
//! Two implementations:
//! - [`MemoryHub`] — in-process channels, for tests and single-process
//!   embedding
//! - `zmq` — ZeroMQ DEALER/ROUTER over TCP (default `zeromq` feature)
//!
//! Each concrete socket is owned by a single spawned I/O task; the handles
//! reach it over channels, which serializes every send and every read of the
//! non-thread-safe socket.

use std::fmt;

pub mod link;
pub mod memory;
#[cfg(feature = "zeromq")]
pub mod zmq;

pub use link::{Frames, Identity, Link, RouterBinding, RouterHandle, TransportError};
pub use memory::MemoryHub;

/// Where a client connects.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// An in-process hub.
    Memory(MemoryHub),
    /// A TCP endpoint for the ZeroMQ transport, as `tcp://host:port`.
    #[cfg(feature = "zeromq")]
    Tcp(String),
}

impl Endpoint {
    /// Open a link with the given connection identity.
    ///
    /// # Errors
    ///
    /// [`TransportError`] when no router is reachable or the connect fails.
    pub async fn connect(&self, identity: &str) -> Result<Link, TransportError> {
        match self {
            Endpoint::Memory(hub) => hub.connect(identity),
            #[cfg(feature = "zeromq")]
            Endpoint::Tcp(address) => zmq::connect(address, identity).await,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Memory(_) => f.write_str("memory"),
            #[cfg(feature = "zeromq")]
            Endpoint::Tcp(address) => f.write_str(address),
        }
    }
}
