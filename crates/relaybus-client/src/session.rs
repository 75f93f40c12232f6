//! Client session state machine.
//!
//! A session moves between disconnected and connected through an
//! acknowledged CONNECT handshake. Heartbeat failure triggers an internal
//! reconnect that re-runs the handshake and replays the subscription list
//! without the caller ever observing a disconnected session.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use relaybus_proto::{
    header, next_command_id, verify_ack, Delivery, Headers, Outbound, Packet, TopicResolver, Verb,
    PROTOCOL_VERSION,
};
use relaybus_transport::{Endpoint, Link};

use crate::config::ClientConfig;
use crate::error::{ClientError, HandshakeError};
use crate::heartbeat::{self, SessionClock};

/// How long a best-effort DISCONNECT gets to flush before the link drops.
const FLUSH_PAUSE: Duration = Duration::from_millis(100);

/// A client session against one broker.
///
/// Cheap to clone; all clones share the same connection, subscription list,
/// and heartbeat monitors. [`ClientSession::receive`] is the only call
/// expected to block for long.
#[derive(Debug, Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    /// A session talking to `endpoint`.
    #[must_use]
    pub fn new(config: ClientConfig, endpoint: Endpoint) -> Self {
        let resolver = TopicResolver::new(config.identity.clone(), config.pid);
        let clock = StdMutex::new(SessionClock::new(config.heartbeat));
        let subscriptions = StdMutex::new(config.subscriptions.clone());
        Self {
            inner: Arc::new(SessionInner {
                config,
                resolver,
                endpoint,
                link: Mutex::new(None),
                subscriptions,
                clock,
                monitors: Mutex::new(None),
            }),
        }
    }

    /// A session wired to the TCP broker named in the configuration.
    #[cfg(feature = "zeromq")]
    #[must_use]
    pub fn from_config(config: ClientConfig) -> Self {
        let endpoint = Endpoint::Tcp(config.endpoint());
        Self::new(config, endpoint)
    }

    /// Connect to the broker.
    ///
    /// Opens a fresh link under a unique connection identity, performs the
    /// CONNECT handshake, replays any subscriptions carried over from a
    /// previous connection as one SUB command, and starts the heartbeat
    /// monitors (idempotent if they are already running).
    ///
    /// # Errors
    ///
    /// [`ClientError::Handshake`] when the broker's acknowledgement is
    /// missing or does not match; transport errors when the endpoint is
    /// unreachable. The link is torn down on failure so a retry starts
    /// clean.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.connect_inner(true).await
    }

    /// Disconnect from the broker.
    ///
    /// Sends a best-effort DISCONNECT (never acknowledged), waits briefly
    /// for it to flush, and drops the link. With `stop_monitors` the
    /// heartbeat monitors are signalled and joined first; a heartbeat
    /// monitor reconnecting must pass `false` to avoid waiting on itself.
    pub async fn disconnect(&self, stop_monitors: bool) {
        self.inner.disconnect(stop_monitors).await;
    }

    /// Subscribe to a topic.
    ///
    /// The local subscription list is updated only after the broker
    /// acknowledges. No delivery can interleave the command and its
    /// acknowledgement: deliveries for the topic only start once the broker
    /// has applied this subscription.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] without a link,
    /// [`ClientError::Handshake`] when the acknowledgement goes wrong.
    pub async fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.inner.subscribe(topic).await
    }

    /// Unsubscribe from a topic. The local list is updated only after the
    /// broker acknowledges.
    ///
    /// # Errors
    ///
    /// See [`ClientSession::subscribe`].
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.inner.unsubscribe(topic).await
    }

    /// Publish a message: one PUT per resolved destination, so a direct
    /// request produces one PUT per discovered target. Fire-and-forget; no
    /// acknowledgement is awaited.
    ///
    /// # Errors
    ///
    /// [`ClientError::Resolve`] when the message cannot be resolved to a
    /// topic, [`ClientError::NotConnected`] without a link.
    pub async fn publish(&self, message: &Outbound) -> Result<(), ClientError> {
        self.inner.publish(message).await
    }

    /// Block until the broker delivers a message.
    ///
    /// Keepalives refresh the receive deadline and are skipped silently.
    ///
    /// # Errors
    ///
    /// [`ClientError::MessageNotReceived`] when the link is gone or was
    /// torn down mid-wait (typically by a heartbeat reconnect); transient,
    /// retry after the carried backoff.
    pub async fn receive(&self) -> Result<Delivery, ClientError> {
        self.inner.receive().await
    }

    /// The topics this session is subscribed to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .clone()
    }

    /// The topic resolver for this session's identity.
    #[must_use]
    pub fn resolver(&self) -> &TopicResolver {
        &self.inner.resolver
    }

    /// Whether a link to the broker currently exists.
    pub async fn is_connected(&self) -> bool {
        self.inner.link.lock().await.is_some()
    }
}

struct Monitors {
    shutdown: watch::Sender<bool>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

pub(crate) struct SessionInner {
    pub(crate) config: ClientConfig,
    resolver: TopicResolver,
    endpoint: Endpoint,
    link: Mutex<Option<Link>>,
    subscriptions: StdMutex<Vec<String>>,
    pub(crate) clock: StdMutex<SessionClock>,
    monitors: Mutex<Option<Monitors>>,
}

impl std::fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInner")
            .field("identity", &self.config.identity)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    pub(crate) async fn connect_inner(
        self: &Arc<Self>,
        start_monitors: bool,
    ) -> Result<(), ClientError> {
        // unique per connection so a reconnect never collides with the
        // broker's record of the previous connection
        let connection_id = format!(
            "{} {} {}",
            self.config.identity,
            self.config.pid,
            Uuid::new_v4()
        );
        debug!(endpoint = %self.endpoint, identity = %connection_id, "connecting");
        let link = self.endpoint.connect(&connection_id).await?;
        {
            let mut slot = self.link.lock().await;
            if let Some(old) = slot.replace(link.clone()) {
                old.close();
            }
        }

        let command_id = next_command_id();
        let mut headers = Headers::new();
        headers.set(header::VERSION, PROTOCOL_VERSION);
        headers.set(header::TTL, self.config.heartbeat.as_millis().to_string());
        headers.set(header::ID, command_id.as_str());
        self.send(&Packet::new(Verb::Connect, headers, Vec::new()))
            .await?;
        if let Err(e) = self.expect_ok_with(&link, &command_id).await {
            self.teardown_link().await;
            return Err(e.into());
        }
        info!(endpoint = %self.endpoint, "connected to broker");

        let topics = self
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .clone();
        if !topics.is_empty() {
            if let Err(e) = self.request_subscription(&link, Verb::Sub, &topics).await {
                self.teardown_link().await;
                return Err(e);
            }
            debug!(count = topics.len(), "replayed subscriptions");
        }

        self.clock.lock().expect("clock lock poisoned").reset();
        if start_monitors {
            self.start_monitors().await;
        }
        Ok(())
    }

    pub(crate) async fn disconnect(&self, stop_monitors: bool) {
        if stop_monitors {
            self.stop_monitors().await;
        }
        if let Some(link) = self.current_link().await {
            // best effort; the broker may already consider us gone
            if link
                .send(Packet::bare(Verb::Disconnect).encode())
                .await
                .is_ok()
            {
                self.clock.lock().expect("clock lock poisoned").note_send();
                sleep(FLUSH_PAUSE).await;
            }
        }
        self.teardown_link().await;
        info!("disconnected");
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        debug!(topic, "subscribing");
        self.request_subscription(&link, Verb::Sub, &[topic.to_string()])
            .await?;
        let mut subscriptions = self
            .subscriptions
            .lock()
            .expect("subscriptions lock poisoned");
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        debug!(topic, "unsubscribing");
        self.request_subscription(&link, Verb::Unsub, &[topic.to_string()])
            .await?;
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .retain(|t| t != topic);
        Ok(())
    }

    async fn publish(&self, message: &Outbound) -> Result<(), ClientError> {
        let envelopes = self.resolver.resolve_publish(message)?;
        for envelope in envelopes {
            let mut headers = Headers::new();
            headers.set(header::TOPIC, envelope.topic.as_str());
            if let Some(reply_to) = envelope.reply_to.as_deref() {
                headers.set(header::REPLY_TO, reply_to);
            }
            debug!(topic = %envelope.topic, "publishing");
            self.send(&Packet::new(
                Verb::Put,
                headers,
                vec![message.payload.clone()],
            ))
            .await?;
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, ClientError> {
        loop {
            let link = self
                .current_link()
                .await
                .ok_or_else(|| self.not_received())?;
            let Some(frames) = link.recv().await else {
                // torn down underneath us, usually by a reconnect
                return Err(self.not_received());
            };
            self.note_recv();
            let packet = match Packet::decode(frames) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(error = %e, "discarding malformed frames");
                    continue;
                }
            };
            match packet.kind() {
                Some(Verb::Noop) => debug!("keepalive from broker"),
                Some(Verb::Message) => {
                    let Some(topic) = packet.headers.topic() else {
                        warn!("discarding MESSAGE without a topic");
                        continue;
                    };
                    return Ok(Delivery {
                        topic: topic.to_string(),
                        reply_to: packet.headers.reply_to().map(str::to_string),
                        payload: packet.body.into_iter().next().unwrap_or_default(),
                    });
                }
                _ => debug!(verb = %packet.verb, "ignoring unexpected verb"),
            }
        }
    }

    pub(crate) async fn send_keepalive(&self) -> Result<(), ClientError> {
        self.send(&Packet::bare(Verb::Noop)).await
    }

    async fn request_subscription(
        &self,
        link: &Link,
        verb: Verb,
        topics: &[String],
    ) -> Result<(), ClientError> {
        let command_id = next_command_id();
        let mut headers = Headers::new();
        headers.set(header::ID, command_id.as_str());
        let body = topics
            .iter()
            .map(|topic| Bytes::copy_from_slice(topic.as_bytes()))
            .collect();
        self.send(&Packet::new(verb, headers, body)).await?;
        self.expect_ok_with(link, &command_id).await?;
        Ok(())
    }

    /// Block on the next inbound frame sequence and require it to be the
    /// matching acknowledgement; anything else fails the handshake.
    async fn expect_ok_with(&self, link: &Link, command_id: &str) -> Result<(), HandshakeError> {
        let frames = match timeout(self.config.ack_timeout, link.recv()).await {
            Err(_) => {
                return Err(HandshakeError::Timeout {
                    id: command_id.to_string(),
                })
            }
            Ok(None) => return Err(HandshakeError::ConnectionClosed),
            Ok(Some(frames)) => frames,
        };
        self.note_recv();
        let packet = Packet::decode(frames)?;
        verify_ack(&packet, command_id)?;
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<(), ClientError> {
        let link = self.current_link().await.ok_or(ClientError::NotConnected)?;
        link.send(packet.encode()).await?;
        // every outbound frame sequence pushes the send deadline out
        self.clock.lock().expect("clock lock poisoned").note_send();
        Ok(())
    }

    async fn current_link(&self) -> Option<Link> {
        self.link.lock().await.clone()
    }

    async fn teardown_link(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.close();
        }
    }

    fn note_recv(&self) {
        self.clock.lock().expect("clock lock poisoned").note_recv();
    }

    fn not_received(&self) -> ClientError {
        ClientError::MessageNotReceived {
            backoff: self.config.retry_pause,
        }
    }

    async fn start_monitors(self: &Arc<Self>) {
        let mut slot = self.monitors.lock().await;
        if slot.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let send_task = tokio::spawn(heartbeat::send_monitor(
            Arc::clone(self),
            shutdown_rx.clone(),
        ));
        let recv_task = tokio::spawn(heartbeat::receive_monitor(Arc::clone(self), shutdown_rx));
        *slot = Some(Monitors {
            shutdown,
            send_task,
            recv_task,
        });
        debug!("heartbeat monitors started");
    }

    async fn stop_monitors(&self) {
        let monitors = self.monitors.lock().await.take();
        if let Some(monitors) = monitors {
            let _ = monitors.shutdown.send(true);
            let _ = monitors.send_task.await;
            let _ = monitors.recv_task.await;
            debug!("heartbeat monitors stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use relaybus_proto::AckError;
    use relaybus_transport::{Frames, Identity, MemoryHub, RouterHandle};
    use tokio::time::timeout as within;

    const TICK: Duration = Duration::from_secs(1);

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::new("node1", 4242);
        config.heartbeat = Duration::from_secs(30);
        config.ack_timeout = Duration::from_millis(500);
        config.retry_pause = Duration::from_millis(50);
        config
    }

    fn session(hub: &MemoryHub) -> ClientSession {
        ClientSession::new(test_config(), Endpoint::Memory(hub.clone()))
    }

    /// Records every decoded packet and, when `ack` is set, acknowledges
    /// every command id it sees.
    struct ScriptedBroker {
        packets: Arc<StdMutex<Vec<Packet>>>,
        last_client: Arc<StdMutex<Option<Identity>>>,
        handle: RouterHandle,
    }

    impl ScriptedBroker {
        fn spawn(hub: &MemoryHub, ack: bool) -> Self {
            let mut binding = hub.bind();
            let handle = binding.handle();
            let packets = Arc::new(StdMutex::new(Vec::new()));
            let last_client = Arc::new(StdMutex::new(None));

            let recorded = Arc::clone(&packets);
            let seen = Arc::clone(&last_client);
            let reply_handle = handle.clone();
            tokio::spawn(async move {
                while let Some((identity, frames)) = binding.recv().await {
                    *seen.lock().unwrap() = Some(identity.clone());
                    let Ok(packet) = Packet::decode(frames) else {
                        continue;
                    };
                    // record before acking so an acknowledged command is
                    // always visible to assertions
                    recorded.lock().unwrap().push(packet.clone());
                    if ack {
                        if let Some(id) = packet.headers.command_id() {
                            let mut headers = Headers::new();
                            headers.set(header::ID, id);
                            let reply = Packet::new(Verb::Ok, headers, Vec::new());
                            let _ = reply_handle.send(identity, reply.encode()).await;
                        }
                    }
                }
            });

            Self {
                packets,
                last_client,
                handle,
            }
        }

        fn recorded(&self, verb: Verb) -> Vec<Packet> {
            self.packets
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.kind() == Some(verb))
                .cloned()
                .collect()
        }

        async fn send_to_client(&self, frames: Frames) {
            let identity = self
                .last_client
                .lock()
                .unwrap()
                .clone()
                .expect("no client seen yet");
            self.handle.send(identity, frames).await.unwrap();
        }
    }

    #[tokio::test]
    async fn connect_handshake_succeeds() {
        let hub = MemoryHub::new();
        let broker = ScriptedBroker::spawn(&hub, true);
        let session = session(&hub);

        within(TICK, session.connect()).await.unwrap().unwrap();
        assert!(session.is_connected().await);

        let connects = broker.recorded(Verb::Connect);
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].headers.version(), Some(PROTOCOL_VERSION));
        assert_eq!(connects[0].headers.ttl_ms().unwrap(), Some(30_000));

        session.disconnect(true).await;
        assert!(!session.is_connected().await);

        // DISCONNECT is never acknowledged; wait for the broker to see it
        within(TICK, async {
            while broker.recorded(Verb::Disconnect).is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn mismatched_ack_id_fails_the_handshake() {
        let hub = MemoryHub::new();
        let mut binding = hub.bind();
        tokio::spawn(async move {
            while let Some((identity, _frames)) = binding.recv().await {
                let mut headers = Headers::new();
                headers.set(header::ID, "not-the-right-id");
                let reply = Packet::new(Verb::Ok, headers, Vec::new());
                let _ = binding.handle().send(identity, reply.encode()).await;
            }
        });

        let session = session(&hub);
        let err = within(TICK, session.connect()).await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Handshake(HandshakeError::Ack(AckError::IdMismatch { .. }))
        ));
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn silent_broker_times_out_the_handshake() {
        let hub = MemoryHub::new();
        let broker = ScriptedBroker::spawn(&hub, false);
        let session = session(&hub);

        let err = within(TICK, session.connect()).await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Handshake(HandshakeError::Timeout { .. })
        ));
        assert!(!session.is_connected().await);
        drop(broker);
    }

    #[tokio::test]
    async fn subscribe_updates_the_local_list_only_after_ack() {
        let hub = MemoryHub::new();
        let broker = ScriptedBroker::spawn(&hub, true);
        let session = session(&hub);

        within(TICK, session.connect()).await.unwrap().unwrap();
        within(TICK, session.subscribe("prod myagent"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.subscriptions(), vec!["prod myagent".to_string()]);

        within(TICK, session.unsubscribe("prod myagent"))
            .await
            .unwrap()
            .unwrap();
        assert!(session.subscriptions().is_empty());

        let subs = broker.recorded(Verb::Sub);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].body, vec![Bytes::from_static(b"prod myagent")]);
        assert_eq!(broker.recorded(Verb::Unsub).len(), 1);
    }

    #[tokio::test]
    async fn publish_direct_request_sends_one_put_per_target() {
        let hub = MemoryHub::new();
        let broker = ScriptedBroker::spawn(&hub, true);
        let session = session(&hub);

        within(TICK, session.connect()).await.unwrap().unwrap();
        let message = Outbound::direct_request(
            "prod",
            "myagent",
            vec!["alpha".to_string(), "beta".to_string()],
            Bytes::from_static(b"ping"),
        );
        within(TICK, session.publish(&message))
            .await
            .unwrap()
            .unwrap();

        // publish is fire-and-forget; wait for the broker task to record
        let puts = within(TICK, async {
            loop {
                let puts = broker.recorded(Verb::Put);
                if puts.len() == 2 {
                    return puts;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let topics: Vec<_> = puts
            .iter()
            .map(|p| p.headers.topic().unwrap().to_string())
            .collect();
        assert_eq!(topics, vec!["prod nodes alpha", "prod nodes beta"]);
        for put in &puts {
            assert_eq!(put.headers.reply_to(), Some("prod reply node1 4242"));
            assert_eq!(put.body, vec![Bytes::from_static(b"ping")]);
        }
    }

    #[tokio::test]
    async fn receive_skips_keepalives_and_returns_the_delivery() {
        let hub = MemoryHub::new();
        let broker = ScriptedBroker::spawn(&hub, true);
        let session = session(&hub);

        within(TICK, session.connect()).await.unwrap().unwrap();

        broker.send_to_client(Packet::bare(Verb::Noop).encode()).await;
        let mut headers = Headers::new();
        headers.set(header::TOPIC, "prod myagent");
        headers.set(header::REPLY_TO, "prod reply other 7");
        let message = Packet::new(Verb::Message, headers, vec![Bytes::from_static(b"ping")]);
        broker.send_to_client(message.encode()).await;

        let delivery = within(TICK, session.receive()).await.unwrap().unwrap();
        assert_eq!(delivery.topic, "prod myagent");
        assert_eq!(delivery.reply_to.as_deref(), Some("prod reply other 7"));
        assert_eq!(delivery.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn receive_after_disconnect_is_retryable() {
        let hub = MemoryHub::new();
        let _broker = ScriptedBroker::spawn(&hub, true);
        let session = session(&hub);

        within(TICK, session.connect()).await.unwrap().unwrap();
        session.disconnect(true).await;

        let err = within(TICK, session.receive()).await.unwrap().unwrap_err();
        match err {
            ClientError::MessageNotReceived { backoff } => {
                assert_eq!(backoff, Duration::from_millis(50));
            }
            other => panic!("expected MessageNotReceived, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_replays_the_subscription_list() {
        let hub = MemoryHub::new();
        let broker = ScriptedBroker::spawn(&hub, true);
        let session = session(&hub);

        within(TICK, session.connect()).await.unwrap().unwrap();
        within(TICK, session.subscribe("prod myagent"))
            .await
            .unwrap()
            .unwrap();
        within(TICK, session.subscribe("prod other"))
            .await
            .unwrap()
            .unwrap();
        let before = session.subscriptions();

        session.disconnect(false).await;
        within(TICK, session.connect()).await.unwrap().unwrap();

        assert_eq!(session.subscriptions(), before);
        // the replay arrives as one SUB carrying the whole list
        let subs = broker.recorded(Verb::Sub);
        let replay = subs.last().unwrap();
        assert_eq!(
            replay.body,
            vec![
                Bytes::from_static(b"prod myagent"),
                Bytes::from_static(b"prod other"),
            ]
        );
    }
}
