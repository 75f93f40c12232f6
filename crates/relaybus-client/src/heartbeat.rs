//! Session heartbeat state and monitor loops.
//!
//! Two background tasks guard the connection: the send monitor keeps the
//! broker's receive deadline fed with NOOPs, the receive monitor tears the
//! session down and reconnects when the broker goes quiet past its own
//! deadline. Both run until the shutdown signal flips, logging and carrying
//! on past any error; shutdown is checked at every sleep/wake boundary and
//! the tasks are joined, never killed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use relaybus_proto::heartbeat::{recv_deadline, send_deadline};

use crate::session::SessionInner;

/// Deadline bookkeeping for one session.
///
/// `note_send` is called after every outbound frame sequence, not only
/// keepalives, so regular traffic keeps pushing the send deadline out.
#[derive(Debug)]
pub(crate) struct SessionClock {
    ttl: Duration,
    next_recv_by: Instant,
    next_send_by: Instant,
}

impl SessionClock {
    pub(crate) fn new(ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            ttl,
            next_recv_by: now + recv_deadline(ttl),
            next_send_by: now + send_deadline(ttl),
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.ttl);
    }

    pub(crate) fn note_recv(&mut self) {
        self.next_recv_by = Instant::now() + recv_deadline(self.ttl);
    }

    pub(crate) fn note_send(&mut self) {
        self.next_send_by = Instant::now() + send_deadline(self.ttl);
    }

    pub(crate) fn next_recv_by(&self) -> Instant {
        self.next_recv_by
    }

    pub(crate) fn next_send_by(&self) -> Instant {
        self.next_send_by
    }

    pub(crate) fn recv_overdue(&self) -> bool {
        Instant::now() >= self.next_recv_by
    }

    pub(crate) fn send_due(&self) -> bool {
        Instant::now() >= self.next_send_by
    }
}

pub(crate) async fn send_monitor(session: Arc<SessionInner>, mut shutdown: watch::Receiver<bool>) {
    debug!("send-heartbeat monitor running");
    loop {
        let deadline = session.clock.lock().expect("clock lock poisoned").next_send_by();
        tokio::select! {
            _ = shutdown.changed() => break,
            () = sleep_until(deadline) => {}
        }
        if !session.clock.lock().expect("clock lock poisoned").send_due() {
            // another send already pushed the deadline out
            continue;
        }
        match session.send_keepalive().await {
            Ok(()) => debug!("sent keepalive"),
            Err(e) => {
                // the receive monitor owns reconnection; just pace the retry
                debug!(error = %e, "keepalive failed");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = sleep(session.config.retry_pause) => {}
                }
            }
        }
    }
    debug!("send-heartbeat monitor stopped");
}

// Returns a boxed `Send` future rather than an `async fn`'s opaque `impl Future`:
// the receive monitor reconnects through `SessionInner::connect_inner` ->
// `start_monitors`, which spawns the receive monitor again. As an `async fn`
// that cycle makes auto-trait `Send` inference recurse forever; erasing the
// type at this boundary breaks the cycle. Behavior is unchanged.
pub(crate) fn receive_monitor(
    session: Arc<SessionInner>,
    shutdown: watch::Receiver<bool>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(receive_monitor_inner(session, shutdown))
}

async fn receive_monitor_inner(
    session: Arc<SessionInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("receive-heartbeat monitor running");
    loop {
        let deadline = session.clock.lock().expect("clock lock poisoned").next_recv_by();
        tokio::select! {
            _ = shutdown.changed() => break,
            () = sleep_until(deadline) => {}
        }
        if !session.clock.lock().expect("clock lock poisoned").recv_overdue() {
            continue;
        }
        warn!("nothing heard from the broker within the receive deadline; reconnecting");
        session.disconnect(false).await;
        tokio::select! {
            _ = shutdown.changed() => break,
            () = sleep(session.config.retry_pause) => {}
        }
        match session.connect_inner(false).await {
            Ok(()) => info!("reconnected"),
            Err(e) => {
                // stay in the loop; the next pass retries after the pause
                warn!(error = %e, "reconnect attempt failed");
            }
        }
    }
    debug!("receive-heartbeat monitor stopped");
}
