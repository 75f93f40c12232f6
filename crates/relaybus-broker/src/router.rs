//! Broker message pump.
//!
//! A single task owns the inbound side of the router socket and all registry
//! mutations on that path; the heartbeat scans and the pump share one
//! outbound handle and the registry lock. Per-message failures become ERROR
//! replies to the offending client and never take the pump down.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use relaybus_proto::{header, Headers, Packet, ProtocolError, Verb};
use relaybus_transport::{Frames, Identity, RouterBinding, RouterHandle};

use crate::config::BrokerConfig;
use crate::heartbeat;
use crate::registry::Registry;

/// The broker: one router socket, a client registry, and the scan tasks.
pub struct Broker {
    config: BrokerConfig,
}

impl Broker {
    /// A broker with the given configuration.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Run over `binding` until `shutdown` flips.
    ///
    /// Spawns the keepalive, eviction, and status tasks, pumps inbound
    /// messages, and on shutdown signals and joins every task before
    /// closing the binding.
    pub async fn run(self, mut binding: RouterBinding, mut shutdown: watch::Receiver<bool>) {
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            outbound: binding.handle(),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            default_scan: self.config.scan_interval,
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let keepalive = tokio::spawn(heartbeat::keepalive_loop(
            Arc::clone(&shared),
            stop_rx.clone(),
        ));
        let eviction = tokio::spawn(heartbeat::eviction_loop(
            Arc::clone(&shared),
            stop_rx.clone(),
        ));
        let status = tokio::spawn(status_loop(
            Arc::clone(&shared),
            stop_rx,
            self.config.status_interval,
        ));

        info!("broker entering main loop");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                inbound = binding.recv() => match inbound {
                    Some((identity, frames)) => shared.handle(identity, frames).await,
                    None => {
                        warn!("transport closed; stopping");
                        break;
                    }
                },
            }
        }

        let _ = stop_tx.send(true);
        let _ = keepalive.await;
        let _ = eviction.await;
        let _ = status.await;
        binding.close();
        info!("broker stopped");
    }
}

pub(crate) struct Shared {
    pub(crate) registry: Mutex<Registry>,
    pub(crate) outbound: RouterHandle,
    pub(crate) received: AtomicU64,
    pub(crate) sent: AtomicU64,
    pub(crate) default_scan: Duration,
}

impl Shared {
    /// Handle one inbound frame sequence from `identity`.
    pub(crate) async fn handle(&self, identity: Identity, frames: Frames) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.lock_registry().ensure(&identity, Instant::now());

        match Packet::decode(frames) {
            Ok(packet) => {
                let command_id = packet.headers.command_id().map(str::to_string);
                match self.apply(&identity, &packet).await {
                    Ok(()) => {
                        // acknowledgement contract: every command carrying
                        // an id gets an OK echoing it
                        if let Some(id) = command_id {
                            self.send_ok(&identity, &id).await;
                        }
                    }
                    Err(e) => {
                        warn!(
                            client = %identity_str(&identity),
                            error = %e,
                            "failed to handle message"
                        );
                        self.send_error(&identity, &e.to_string(), command_id.as_deref())
                            .await;
                    }
                }
            }
            Err(e) => {
                warn!(
                    client = %identity_str(&identity),
                    error = %e,
                    "discarding malformed frames"
                );
                self.send_error(&identity, &e.to_string(), None).await;
            }
        }

        self.lock_registry().note_recv(&identity, Instant::now());
    }

    async fn apply(&self, identity: &Identity, packet: &Packet) -> Result<(), HandleError> {
        match packet.kind() {
            Some(Verb::Connect) => {
                info!(
                    client = %identity_str(identity),
                    version = ?packet.headers.version(),
                    "client connected"
                );
                if let Some(ttl_ms) = packet.headers.ttl_ms()? {
                    self.lock_registry().set_ttl(
                        identity,
                        Duration::from_millis(ttl_ms),
                        Instant::now(),
                    );
                }
                Ok(())
            }
            Some(Verb::Disconnect) => {
                info!(client = %identity_str(identity), "client disconnected");
                self.lock_registry().remove(identity);
                Ok(())
            }
            Some(Verb::Sub) => {
                let topics = body_topics(packet)?;
                debug!(client = %identity_str(identity), ?topics, "subscribing");
                self.lock_registry().subscribe(identity, topics);
                Ok(())
            }
            Some(Verb::Unsub) => {
                let topics = body_topics(packet)?;
                debug!(client = %identity_str(identity), ?topics, "unsubscribing");
                self.lock_registry().unsubscribe(identity, &topics);
                Ok(())
            }
            Some(Verb::Put) => self.fan_out(identity, packet).await,
            Some(Verb::Noop) => Ok(()),
            Some(Verb::Message | Verb::Ok | Verb::Error) | None => {
                warn!(client = %identity_str(identity), verb = %packet.verb, "unknown verb");
                self.send_error(
                    identity,
                    &format!("Unknown verb '{}'", packet.verb),
                    packet.headers.command_id(),
                )
                .await;
                Ok(())
            }
        }
    }

    /// Forward a PUT to every exact-topic subscriber except the sender.
    async fn fan_out(&self, sender: &Identity, packet: &Packet) -> Result<(), HandleError> {
        let topic = packet
            .headers
            .topic()
            .ok_or(HandleError::MissingTopic)?
            .to_string();

        let mut headers = packet.headers.clone();
        headers.remove(header::ID);
        let forward = Packet::new(Verb::Message, headers, packet.body.clone()).encode();

        let recipients = self.lock_registry().subscribers_of(&topic, sender);
        let count = recipients.len();
        for identity in recipients {
            self.send_to(&identity, forward.clone()).await;
        }
        info!(
            topic = %topic,
            from = %identity_str(sender),
            recipients = count,
            "forwarded message"
        );
        Ok(())
    }

    pub(crate) async fn send_to(&self, identity: &Identity, frames: Frames) {
        if let Err(e) = self.outbound.send(identity.clone(), frames).await {
            debug!(client = %identity_str(identity), error = %e, "send failed");
            return;
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.lock_registry().note_send(identity, Instant::now());
    }

    async fn send_ok(&self, identity: &Identity, id: &str) {
        let mut headers = Headers::new();
        headers.set(header::ID, id);
        self.send_to(identity, Packet::new(Verb::Ok, headers, Vec::new()).encode())
            .await;
    }

    async fn send_error(&self, identity: &Identity, text: &str, id: Option<&str>) {
        let mut headers = Headers::new();
        headers.set(header::MESSAGE, text);
        if let Some(id) = id {
            headers.set(header::ID, id);
        }
        self.send_to(identity, Packet::new(Verb::Error, headers, Vec::new()).encode())
            .await;
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry lock poisoned")
    }
}

pub(crate) fn identity_str(identity: &Identity) -> Cow<'_, str> {
    String::from_utf8_lossy(identity)
}

fn body_topics(packet: &Packet) -> Result<Vec<String>, HandleError> {
    packet
        .body
        .iter()
        .map(|frame| {
            std::str::from_utf8(frame)
                .map(str::to_string)
                .map_err(|_| HandleError::TopicNotUtf8)
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
enum HandleError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// PUT carried no TOPIC header
    #[error("PUT without a TOPIC header")]
    MissingTopic,
    /// A subscription topic frame was not UTF-8
    #[error("topic frame is not valid UTF-8")]
    TopicNotUtf8,
}

async fn status_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>, interval: Duration) {
    let mut last = (0usize, 0u64, 0u64);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            () = sleep(interval) => {}
        }
        let snapshot = (
            shared.lock_registry().client_count(),
            shared.received.load(Ordering::Relaxed),
            shared.sent.load(Ordering::Relaxed),
        );
        if snapshot != last {
            info!(
                clients = snapshot.0,
                received = snapshot.1,
                sent = snapshot.2,
                "status"
            );
            last = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use relaybus_transport::{Link, MemoryHub};
    use tokio::time::timeout as within;

    const TICK: Duration = Duration::from_secs(5);

    fn identity(name: &str) -> Identity {
        Bytes::copy_from_slice(name.as_bytes())
    }

    // the pump is exercised by calling handle() directly; the returned
    // binding keeps the routing task alive for replies
    fn shared_on(hub: &MemoryHub) -> (Arc<Shared>, RouterBinding) {
        let binding = hub.bind();
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            outbound: binding.handle(),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            default_scan: Duration::from_millis(100),
        });
        (shared, binding)
    }

    fn connect_frames(ttl_ms: Option<&str>, id: Option<&str>) -> Frames {
        let mut headers = Headers::new();
        headers.set(header::VERSION, relaybus_proto::PROTOCOL_VERSION);
        if let Some(ttl) = ttl_ms {
            headers.set(header::TTL, ttl);
        }
        if let Some(id) = id {
            headers.set(header::ID, id);
        }
        Packet::new(Verb::Connect, headers, Vec::new()).encode()
    }

    fn sub_frames(id: &str, topics: &[&str]) -> Frames {
        let mut headers = Headers::new();
        headers.set(header::ID, id);
        let body = topics
            .iter()
            .map(|t| Bytes::copy_from_slice(t.as_bytes()))
            .collect();
        Packet::new(Verb::Sub, headers, body).encode()
    }

    fn put_frames(topic: &str, payload: &[u8]) -> Frames {
        let mut headers = Headers::new();
        headers.set(header::TOPIC, topic);
        Packet::new(Verb::Put, headers, vec![Bytes::copy_from_slice(payload)]).encode()
    }

    async fn next_packet(link: &Link) -> Packet {
        let frames = within(TICK, link.recv())
            .await
            .expect("timed out")
            .expect("link closed");
        Packet::decode(frames).expect("undecodable reply")
    }

    #[tokio::test]
    async fn commands_with_an_id_are_acknowledged() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let link = hub.connect("client").unwrap();

        shared
            .handle(identity("client"), connect_frames(Some("30000"), Some("c1")))
            .await;

        let reply = next_packet(&link).await;
        assert_eq!(reply.kind(), Some(Verb::Ok));
        assert_eq!(reply.headers.command_id(), Some("c1"));

        // the status counters saw one message each way
        assert_eq!(shared.received.load(Ordering::Relaxed), 1);
        assert_eq!(shared.sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn put_fans_out_to_exact_subscribers_only() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let foo = hub.connect("foo-sub").unwrap();
        let foobar = hub.connect("foobar-sub").unwrap();

        shared
            .handle(identity("foo-sub"), sub_frames("s1", &["foo"]))
            .await;
        shared
            .handle(identity("foobar-sub"), sub_frames("s2", &["foobar"]))
            .await;
        // drain the two acks
        next_packet(&foo).await;
        next_packet(&foobar).await;

        shared
            .handle(identity("publisher"), put_frames("foo", b"ping"))
            .await;

        let delivery = next_packet(&foo).await;
        assert_eq!(delivery.kind(), Some(Verb::Message));
        assert_eq!(delivery.headers.topic(), Some("foo"));
        assert_eq!(delivery.body, vec![Bytes::from_static(b"ping")]);

        // the prefix-sharing subscriber sees nothing
        assert!(within(Duration::from_millis(50), foobar.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn forwarded_messages_drop_the_command_id_header() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let sub = hub.connect("sub").unwrap();

        shared.handle(identity("sub"), sub_frames("s1", &["t"])).await;
        next_packet(&sub).await;

        let mut headers = Headers::new();
        headers.set(header::TOPIC, "t");
        headers.set(header::REPLY_TO, "prod reply sender 1");
        headers.set(header::ID, "p1");
        let put = Packet::new(Verb::Put, headers, vec![Bytes::from_static(b"x")]);
        shared.handle(identity("publisher"), put.encode()).await;

        let delivery = next_packet(&sub).await;
        assert_eq!(delivery.kind(), Some(Verb::Message));
        assert_eq!(delivery.headers.command_id(), None);
        assert_eq!(delivery.headers.reply_to(), Some("prod reply sender 1"));

        // the publisher still gets its OK for the id it sent
        let publisher = hub.connect("publisher").unwrap();
        shared.handle(identity("publisher"), put.encode()).await;
        let ack = next_packet(&publisher).await;
        assert_eq!(ack.kind(), Some(Verb::Ok));
        assert_eq!(ack.headers.command_id(), Some("p1"));
    }

    #[tokio::test]
    async fn publisher_subscribed_to_the_topic_is_excluded() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let chatty = hub.connect("chatty").unwrap();

        shared
            .handle(identity("chatty"), sub_frames("s1", &["loop"]))
            .await;
        next_packet(&chatty).await;

        shared
            .handle(identity("chatty"), put_frames("loop", b"echo?"))
            .await;
        assert!(within(Duration::from_millis(50), chatty.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_the_record() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let sub = hub.connect("sub").unwrap();

        shared.handle(identity("sub"), sub_frames("s1", &["t"])).await;
        next_packet(&sub).await;
        shared
            .handle(identity("sub"), Packet::bare(Verb::Disconnect).encode())
            .await;
        assert!(!shared.lock_registry().contains(&identity("sub")));

        shared
            .handle(identity("publisher"), put_frames("t", b"gone"))
            .await;
        assert!(within(Duration::from_millis(50), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unknown_verb_gets_an_error_and_the_promised_ok() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let link = hub.connect("client").unwrap();

        let mut headers = Headers::new();
        headers.set(header::ID, "c9");
        let bogus = Packet {
            verb: "BOGUS".to_string(),
            headers,
            body: Vec::new(),
        };
        shared.handle(identity("client"), bogus.encode()).await;

        let first = next_packet(&link).await;
        assert_eq!(first.kind(), Some(Verb::Error));
        assert_eq!(
            first.headers.get(header::MESSAGE),
            Some("Unknown verb 'BOGUS'")
        );
        assert_eq!(first.headers.command_id(), Some("c9"));

        let second = next_packet(&link).await;
        assert_eq!(second.kind(), Some(Verb::Ok));
        assert_eq!(second.headers.command_id(), Some("c9"));
    }

    #[tokio::test]
    async fn malformed_frames_get_an_error_and_the_pump_survives() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let link = hub.connect("client").unwrap();

        // odd header count
        shared
            .handle(
                identity("client"),
                vec![Bytes::from_static(b"PUT"), Bytes::from_static(b"TOPIC")],
            )
            .await;
        let reply = next_packet(&link).await;
        assert_eq!(reply.kind(), Some(Verb::Error));

        // the same client can keep talking
        shared
            .handle(identity("client"), connect_frames(None, Some("c2")))
            .await;
        let reply = next_packet(&link).await;
        assert_eq!(reply.kind(), Some(Verb::Ok));
    }

    #[tokio::test]
    async fn put_without_topic_is_an_error() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let link = hub.connect("client").unwrap();

        let mut headers = Headers::new();
        headers.set(header::ID, "p1");
        let put = Packet::new(Verb::Put, headers, vec![Bytes::from_static(b"x")]);
        shared.handle(identity("client"), put.encode()).await;

        let reply = next_packet(&link).await;
        assert_eq!(reply.kind(), Some(Verb::Error));
        assert_eq!(reply.headers.command_id(), Some("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_is_evicted_after_its_receive_deadline() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let _link = hub.connect("mortal").unwrap();

        shared
            .handle(identity("mortal"), connect_frames(Some("1000"), Some("c1")))
            .await;
        assert!(shared.lock_registry().contains(&identity("mortal")));

        let (stop_tx, stop_rx) = watch::channel(false);
        let scan = tokio::spawn(heartbeat::eviction_loop(Arc::clone(&shared), stop_rx));

        // deadline is 1.05 s after the CONNECT was handled
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!shared.lock_registry().contains(&identity("mortal")));

        let _ = stop_tx.send(true);
        let _ = scan.await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_client_is_kept_alive_before_its_deadline() {
        let hub = MemoryHub::new();
        let (shared, _binding) = shared_on(&hub);
        let link = hub.connect("quiet").unwrap();

        shared
            .handle(identity("quiet"), connect_frames(Some("1000"), Some("c1")))
            .await;
        next_packet(&link).await; // the OK

        let (stop_tx, stop_rx) = watch::channel(false);
        let scan = tokio::spawn(heartbeat::keepalive_loop(Arc::clone(&shared), stop_rx));

        // a NOOP arrives once 0.95 s passes, before the 1.05 s eviction bound
        let noop = next_packet(&link).await;
        assert_eq!(noop.kind(), Some(Verb::Noop));

        let _ = stop_tx.send(true);
        let _ = scan.await;
    }
}
