//! Per-connection client registry.
//!
//! One [`ClientRecord`] per connected peer, keyed by the transport-assigned
//! connection identity. Records are created on the first frame from an
//! unknown identity and destroyed on DISCONNECT or eviction. Heartbeat
//! deadlines are tracked only once a CONNECT has carried a TTL.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use relaybus_proto::heartbeat::{recv_deadline, send_deadline};
use relaybus_transport::Identity;
use tokio::time::Instant;

/// Broker-side state for one connected peer.
#[derive(Debug)]
pub(crate) struct ClientRecord {
    /// Heartbeat interval from the CONNECT header, if any was given.
    pub ttl: Option<Duration>,
    /// Exact-match subscription topics.
    pub subscriptions: HashSet<String>,
    /// When the peer was last heard from.
    pub last_recv: Instant,
    /// Eviction deadline: `last_recv + 1.05 × ttl`.
    pub next_recv_by: Option<Instant>,
    /// When the peer was last sent to.
    pub last_send: Option<Instant>,
    /// Keepalive deadline: `last_send + 0.95 × ttl`.
    pub next_send_by: Option<Instant>,
}

impl ClientRecord {
    fn new(now: Instant) -> Self {
        Self {
            ttl: None,
            subscriptions: HashSet::new(),
            last_recv: now,
            next_recv_by: None,
            last_send: None,
            next_send_by: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    clients: HashMap<Identity, ClientRecord>,
}

impl Registry {
    /// Look up or create the record for `identity`.
    pub fn ensure(&mut self, identity: &Identity, now: Instant) {
        self.clients
            .entry(identity.clone())
            .or_insert_with(|| ClientRecord::new(now));
    }

    /// Drop the record for `identity`, returning whether it existed.
    pub fn remove(&mut self, identity: &Identity) -> bool {
        self.clients.remove(identity).is_some()
    }

    /// Record the negotiated TTL and start the keepalive clock. Existing
    /// subscription state is retained across a repeated CONNECT.
    pub fn set_ttl(&mut self, identity: &Identity, ttl: Duration, now: Instant) {
        if let Some(record) = self.clients.get_mut(identity) {
            record.ttl = Some(ttl);
            record.next_send_by = Some(now + send_deadline(ttl));
        }
    }

    /// Add topics to a client's subscription set.
    pub fn subscribe(&mut self, identity: &Identity, topics: Vec<String>) {
        if let Some(record) = self.clients.get_mut(identity) {
            record.subscriptions.extend(topics);
        }
    }

    /// Remove topics from a client's subscription set.
    pub fn unsubscribe(&mut self, identity: &Identity, topics: &[String]) {
        if let Some(record) = self.clients.get_mut(identity) {
            for topic in topics {
                record.subscriptions.remove(topic);
            }
        }
    }

    /// Every client subscribed to exactly `topic`, except the sender.
    pub fn subscribers_of(&self, topic: &str, exclude: &Identity) -> Vec<Identity> {
        self.clients
            .iter()
            .filter(|(identity, record)| {
                *identity != exclude && record.subscriptions.contains(topic)
            })
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    /// Refresh a client's receive bookkeeping after handling its message.
    pub fn note_recv(&mut self, identity: &Identity, now: Instant) {
        if let Some(record) = self.clients.get_mut(identity) {
            record.last_recv = now;
            if let Some(ttl) = record.ttl {
                record.next_recv_by = Some(now + recv_deadline(ttl));
            }
        }
    }

    /// Refresh a client's send bookkeeping after sending to it.
    pub fn note_send(&mut self, identity: &Identity, now: Instant) {
        if let Some(record) = self.clients.get_mut(identity) {
            record.last_send = Some(now);
            if let Some(ttl) = record.ttl {
                record.next_send_by = Some(now + send_deadline(ttl));
            }
        }
    }

    /// Clients whose keepalive deadline has passed.
    pub fn due_keepalives(&self, now: Instant) -> Vec<Identity> {
        self.clients
            .iter()
            .filter(|(_, record)| record.next_send_by.is_some_and(|at| now >= at))
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    /// Clients whose eviction deadline has passed, with how long they have
    /// been silent.
    pub fn overdue(&self, now: Instant) -> Vec<(Identity, Duration)> {
        self.clients
            .iter()
            .filter(|(_, record)| record.next_recv_by.is_some_and(|at| now >= at))
            .map(|(identity, record)| {
                (
                    identity.clone(),
                    now.saturating_duration_since(record.last_recv),
                )
            })
            .collect()
    }

    /// The nearest upcoming keepalive deadline across all clients.
    pub fn earliest_send_deadline(&self) -> Option<Instant> {
        self.clients
            .values()
            .filter_map(|record| record.next_send_by)
            .min()
    }

    /// The nearest upcoming eviction deadline across all clients.
    pub fn earliest_recv_deadline(&self) -> Option<Instant> {
        self.clients
            .values()
            .filter_map(|record| record.next_recv_by)
            .min()
    }

    /// How many clients are currently registered.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    pub fn contains(&self, identity: &Identity) -> bool {
        self.clients.contains_key(identity)
    }

    #[cfg(test)]
    pub fn subscriptions_of(&self, identity: &Identity) -> Option<&HashSet<String>> {
        self.clients
            .get(identity)
            .map(|record| &record.subscriptions)
    }
}
