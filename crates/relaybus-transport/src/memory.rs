//! In-process transport modelling ROUTER/DEALER identity framing.
//!
//! A [`MemoryHub`] stands in for a network: `bind` produces the router side,
//! `connect` produces client links addressed by a caller-chosen identity.
//! Routing behaves like a ROUTER socket: a message addressed to a departed
//! identity is dropped silently, and reconnecting under an identity already
//! in use takes the identity over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::link::{Frames, Identity, Link, RouterBinding, RouterHandle, TransportError, CHANNEL_DEPTH};

/// An in-process router and the clients connected to it.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    to_router: Mutex<Option<mpsc::Sender<(Identity, Frames)>>>,
    peers: Mutex<HashMap<Identity, mpsc::Sender<Frames>>>,
}

impl MemoryHub {
    /// A hub with no router bound yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the router side of the hub.
    ///
    /// Rebinding replaces the previous binding: already-connected clients
    /// keep their links, new inbound traffic flows to the new binding.
    #[must_use]
    pub fn bind(&self) -> RouterBinding {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
        *self.inner.to_router.lock().expect("hub lock poisoned") = Some(in_tx);

        let (out_tx, mut out_rx) = mpsc::channel::<(Identity, Frames)>(CHANNEL_DEPTH);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            loop {
                let routed = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    routed = out_rx.recv() => match routed {
                        Some(routed) => routed,
                        None => break,
                    },
                };
                let (identity, frames) = routed;
                let peer = inner
                    .peers
                    .lock()
                    .expect("hub lock poisoned")
                    .get(&identity)
                    .cloned();
                match peer {
                    Some(tx) => {
                        if tx.send(frames).await.is_err() {
                            debug!("peer receiver gone, dropping frames");
                        }
                    }
                    None => debug!("dropping frames for departed peer"),
                }
            }
        });

        RouterBinding::new(RouterHandle::new(out_tx), in_rx, shutdown_tx)
    }

    /// Connect a client link under `identity`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Endpoint`] when no router is bound to this hub.
    pub fn connect(&self, identity: &str) -> Result<Link, TransportError> {
        let to_router = self
            .inner
            .to_router
            .lock()
            .expect("hub lock poisoned")
            .clone()
            .ok_or_else(|| TransportError::Endpoint("no router bound to this hub".to_string()))?;

        let identity: Identity = Bytes::copy_from_slice(identity.as_bytes());
        let (peer_tx, peer_rx) = mpsc::channel(CHANNEL_DEPTH);
        self.inner
            .peers
            .lock()
            .expect("hub lock poisoned")
            .insert(identity.clone(), peer_tx.clone());

        let (out_tx, mut out_rx) = mpsc::channel::<Frames>(CHANNEL_DEPTH);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            loop {
                let frames = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    frames = out_rx.recv() => match frames {
                        Some(frames) => frames,
                        None => break,
                    },
                };
                if to_router.send((identity.clone(), frames)).await.is_err() {
                    break;
                }
            }
            // deregister unless a reconnect already took the identity over
            let mut peers = inner.peers.lock().expect("hub lock poisoned");
            if peers
                .get(&identity)
                .is_some_and(|tx| tx.same_channel(&peer_tx))
            {
                peers.remove(&identity);
            }
        });

        Ok(Link::new(out_tx, peer_rx, shutdown_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frames(parts: &[&str]) -> Frames {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn client_to_router_carries_identity() {
        let hub = MemoryHub::new();
        let mut binding = hub.bind();
        let link = hub.connect("peer-1").unwrap();

        link.send(frames(&["NOOP"])).await.unwrap();

        let (identity, received) = timeout(Duration::from_secs(1), binding.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity, Bytes::from_static(b"peer-1"));
        assert_eq!(received, frames(&["NOOP"]));
    }

    #[tokio::test]
    async fn router_routes_by_identity() {
        let hub = MemoryHub::new();
        let binding = hub.bind();
        let alpha = hub.connect("alpha").unwrap();
        let beta = hub.connect("beta").unwrap();

        binding
            .handle()
            .send(Bytes::from_static(b"beta"), frames(&["NOOP"]))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), beta.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, frames(&["NOOP"]));

        // nothing for alpha
        assert!(
            timeout(Duration::from_millis(50), alpha.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn departed_peer_traffic_is_dropped() {
        let hub = MemoryHub::new();
        let binding = hub.bind();
        let link = hub.connect("gone").unwrap();
        link.close();

        // give the forwarder a moment to deregister
        tokio::task::yield_now().await;

        binding
            .handle()
            .send(Bytes::from_static(b"gone"), frames(&["NOOP"]))
            .await
            .unwrap();

        // the router stays usable for other peers
        let other = hub.connect("still-here").unwrap();
        binding
            .handle()
            .send(Bytes::from_static(b"still-here"), frames(&["NOOP"]))
            .await
            .unwrap();
        let received = timeout(Duration::from_secs(1), other.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, frames(&["NOOP"]));
    }

    #[tokio::test]
    async fn closed_link_ends_the_stream() {
        let hub = MemoryHub::new();
        let _binding = hub.bind();
        let link = hub.connect("peer").unwrap();

        link.close();

        let received = timeout(Duration::from_secs(1), link.recv()).await.unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn connect_without_a_router_fails() {
        let hub = MemoryHub::new();
        assert!(matches!(
            hub.connect("early"),
            Err(TransportError::Endpoint(_))
        ));
    }

    #[tokio::test]
    async fn reconnect_takes_the_identity_over() {
        let hub = MemoryHub::new();
        let binding = hub.bind();
        let first = hub.connect("dup").unwrap();
        let second = hub.connect("dup").unwrap();

        binding
            .handle()
            .send(Bytes::from_static(b"dup"), frames(&["NOOP"]))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), second.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, frames(&["NOOP"]));
        assert!(
            timeout(Duration::from_millis(50), first.recv())
                .await
                .is_err()
        );
    }
}
