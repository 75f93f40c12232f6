//! ZeroMQ-backed transport: DEALER client links, a ROUTER broker binding.
//!
//! Each socket is owned by the one I/O task spawned here; the returned
//! handles reach it over channels. The ROUTER side sees the peer identity as
//! the first frame of every inbound message and routes outbound messages by
//! prepending it again.

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};
use zeromq::util::PeerIdentity;
use zeromq::{
    DealerSocket, RouterSocket, Socket, SocketRecv, SocketSend, SocketOptions,
    ZmqMessage,
};

use crate::link::{Frames, Identity, Link, RouterBinding, RouterHandle, TransportError, CHANNEL_DEPTH};

enum Work<O> {
    Out(O),
    In(Result<ZmqMessage, zeromq::ZmqError>),
}

/// Connect a DEALER socket to `endpoint` under the given connection
/// identity and wrap it in a [`Link`].
///
/// # Errors
///
/// [`TransportError::Endpoint`] when the identity is rejected or the
/// connect fails.
pub async fn connect(endpoint: &str, identity: &str) -> Result<Link, TransportError> {
    let peer_id = PeerIdentity::try_from(identity.as_bytes().to_vec())
        .map_err(|e| TransportError::Endpoint(format!("invalid identity '{identity}': {e}")))?;
    let mut options = SocketOptions::default();
    options.peer_identity(peer_id);

    let mut socket = DealerSocket::with_options(options);
    socket
        .connect(endpoint)
        .await
        .map_err(|e| TransportError::Endpoint(format!("connect {endpoint}: {e}")))?;

    let (out_tx, mut out_rx) = mpsc::channel::<Frames>(CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<Frames>(CHANNEL_DEPTH);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        loop {
            let work = tokio::select! {
                _ = shutdown_rx.changed() => break,
                outbound = out_rx.recv() => match outbound {
                    Some(frames) => Work::Out(frames),
                    None => break,
                },
                inbound = socket.recv() => Work::In(inbound),
            };
            match work {
                Work::Out(frames) => {
                    let Some(message) = to_zmq(frames) else { continue };
                    if let Err(e) = socket.send(message).await {
                        error!(error = %e, "dealer send failed");
                        break;
                    }
                }
                Work::In(Ok(message)) => {
                    if in_tx.send(message.into_vec()).await.is_err() {
                        break;
                    }
                }
                Work::In(Err(e)) => {
                    error!(error = %e, "dealer receive failed");
                    break;
                }
            }
        }
    });

    Ok(Link::new(out_tx, in_rx, shutdown_tx))
}

/// Bind a ROUTER socket on `endpoint` and wrap it in a [`RouterBinding`].
///
/// # Errors
///
/// [`TransportError::Endpoint`] when the bind fails.
pub async fn bind(endpoint: &str) -> Result<RouterBinding, TransportError> {
    let mut socket = RouterSocket::new();
    socket
        .bind(endpoint)
        .await
        .map_err(|e| TransportError::Endpoint(format!("bind {endpoint}: {e}")))?;

    let (out_tx, mut out_rx) = mpsc::channel::<(Identity, Frames)>(CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<(Identity, Frames)>(CHANNEL_DEPTH);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        loop {
            let work = tokio::select! {
                _ = shutdown_rx.changed() => break,
                outbound = out_rx.recv() => match outbound {
                    Some(routed) => Work::Out(routed),
                    None => break,
                },
                inbound = socket.recv() => Work::In(inbound),
            };
            match work {
                Work::Out((identity, frames)) => {
                    let mut message = ZmqMessage::from(identity);
                    for frame in frames {
                        message.push_back(frame);
                    }
                    if let Err(e) = socket.send(message).await {
                        // routing to a departed peer is routine for a router
                        debug!(error = %e, "router send failed");
                    }
                }
                Work::In(Ok(message)) => {
                    let mut frames: Vec<Bytes> = message.into_vec();
                    if frames.is_empty() {
                        continue;
                    }
                    let identity = frames.remove(0);
                    if in_tx.send((identity, frames)).await.is_err() {
                        break;
                    }
                }
                Work::In(Err(e)) => {
                    error!(error = %e, "router receive failed");
                    break;
                }
            }
        }
    });

    Ok(RouterBinding::new(RouterHandle::new(out_tx), in_rx, shutdown_tx))
}

fn to_zmq(frames: Frames) -> Option<ZmqMessage> {
    let mut frames = frames.into_iter();
    let mut message = ZmqMessage::from(frames.next()?);
    for frame in frames {
        message.push_back(frame);
    }
    Some(message)
}
