//! Channel-backed socket handles.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

/// One multipart message.
pub type Frames = Vec<Bytes>;

/// Opaque connection identity assigned by the transport. Stable for the life
/// of a connection; the broker uses it as its registry key and as the
/// destination address for routed replies.
pub type Identity = Bytes;

/// Depth of the channels between a handle and its socket task.
pub(crate) const CHANNEL_DEPTH: usize = 128;

/// Transport-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The link or binding has been torn down
    #[error("transport closed")]
    Closed,
    /// The endpoint could not be used
    #[error("endpoint error: {0}")]
    Endpoint(String),
}

/// Client side of one connection.
///
/// Sends go through a cloneable channel sender, so any number of tasks may
/// publish concurrently; the socket task serializes them. Reads go through a
/// shared, locked receiver: the session's blocking receive and the connect
/// handshake are the only readers, one at a time.
#[derive(Debug, Clone)]
pub struct Link {
    tx: mpsc::Sender<Frames>,
    rx: Arc<Mutex<mpsc::Receiver<Frames>>>,
    shutdown: watch::Sender<bool>,
}

impl Link {
    pub(crate) fn new(
        tx: mpsc::Sender<Frames>,
        rx: mpsc::Receiver<Frames>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            shutdown,
        }
    }

    /// Send one multipart message.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the socket task has gone away.
    pub async fn send(&self, frames: Frames) -> Result<(), TransportError> {
        self.tx.send(frames).await.map_err(|_| TransportError::Closed)
    }

    /// Receive the next inbound message. `None` means the link was torn
    /// down underneath the caller.
    pub async fn recv(&self) -> Option<Frames> {
        self.rx.lock().await.recv().await
    }

    /// Tear the link down. Pending receivers observe end-of-stream.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Cloneable handle for addressed sends through a bound router socket.
#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<(Identity, Frames)>,
}

impl RouterHandle {
    pub(crate) fn new(tx: mpsc::Sender<(Identity, Frames)>) -> Self {
        Self { tx }
    }

    /// Route one multipart message to the peer with `identity`. A message
    /// for a departed peer is dropped by the socket, not reported here.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the binding has been torn down.
    pub async fn send(&self, identity: Identity, frames: Frames) -> Result<(), TransportError> {
        self.tx
            .send((identity, frames))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Broker side of a bound router socket.
pub struct RouterBinding {
    handle: RouterHandle,
    inbound: mpsc::Receiver<(Identity, Frames)>,
    shutdown: watch::Sender<bool>,
}

impl RouterBinding {
    pub(crate) fn new(
        handle: RouterHandle,
        inbound: mpsc::Receiver<(Identity, Frames)>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            handle,
            inbound,
            shutdown,
        }
    }

    /// Next inbound message with its sender identity; `None` after close.
    pub async fn recv(&mut self) -> Option<(Identity, Frames)> {
        self.inbound.recv().await
    }

    /// A cloneable handle for addressed sends.
    #[must_use]
    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Stop the socket task.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}
