//! Keepalive and eviction scans.
//!
//! Each scan wakes for the nearest deadline across all clients (or the
//! configured default interval when no client has negotiated a TTL), acts on
//! everything that is due, and goes back to sleep. Both exit only on the
//! shutdown signal, checked at every sleep/wake boundary.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use relaybus_proto::{Packet, Verb};

use crate::router::{identity_str, Shared};

pub(crate) async fn keepalive_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    debug!("keepalive scan running");
    loop {
        let now = Instant::now();
        let due = shared
            .registry
            .lock()
            .expect("registry lock poisoned")
            .due_keepalives(now);
        for identity in due {
            debug!(client = %identity_str(&identity), "sending keepalive");
            shared
                .send_to(&identity, Packet::bare(Verb::Noop).encode())
                .await;
        }

        let next = shared
            .registry
            .lock()
            .expect("registry lock poisoned")
            .earliest_send_deadline();
        let wait = next.map_or(shared.default_scan, |at| {
            at.saturating_duration_since(Instant::now())
        });
        tokio::select! {
            _ = shutdown.changed() => break,
            () = sleep(wait) => {}
        }
    }
    debug!("keepalive scan stopped");
}

pub(crate) async fn eviction_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    debug!("eviction scan running");
    loop {
        let now = Instant::now();
        let stale = shared
            .registry
            .lock()
            .expect("registry lock poisoned")
            .overdue(now);
        for (identity, silent_for) in stale {
            info!(
                client = %identity_str(&identity),
                ?silent_for,
                "client went away, evicting"
            );
            shared
                .registry
                .lock()
                .expect("registry lock poisoned")
                .remove(&identity);
        }

        let next = shared
            .registry
            .lock()
            .expect("registry lock poisoned")
            .earliest_recv_deadline();
        let wait = next.map_or(shared.default_scan, |at| {
            at.saturating_duration_since(Instant::now())
        });
        tokio::select! {
            _ = shutdown.changed() => break,
            () = sleep(wait) => {}
        }
    }
    debug!("eviction scan stopped");
}
