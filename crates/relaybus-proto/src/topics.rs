//! Topic derivation for the addressing modes.
//!
//! Topic layout:
//! - `"<collective> <agent>"` — broadcast to an agent's subscribers
//! - `"<collective> reply <identity> <pid>"` — per-process reply topic
//! - `"<collective> nodes <identity>"` — direct addressing to one node
//!
//! Fan-out matches topics by exact string equality, never by prefix, so a
//! `"nodes"` agent topic and a node's direct topic cannot cross-match.

use crate::message::Outbound;

/// How a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// Fan out to every subscriber of the agent's topic.
    Broadcast,
    /// A request; topic derivation is identical to a broadcast.
    Request,
    /// Addressed to an explicit set of target identities, one topic each.
    DirectRequest,
    /// The inbound topic a node listens on for messages addressed to itself.
    Directed,
    /// A response routed back on the requester's reply topic.
    Reply,
}

impl AddressMode {
    /// Parse a mode name as it appears in configuration.
    ///
    /// # Errors
    ///
    /// `ResolveError::UnknownMode` for anything but the five known names.
    pub fn parse(mode: &str) -> Result<Self, ResolveError> {
        match mode {
            "broadcast" => Ok(AddressMode::Broadcast),
            "request" => Ok(AddressMode::Request),
            "direct_request" => Ok(AddressMode::DirectRequest),
            "directed" => Ok(AddressMode::Directed),
            "reply" => Ok(AddressMode::Reply),
            other => Err(ResolveError::UnknownMode(other.to_string())),
        }
    }

    /// Configuration spelling of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AddressMode::Broadcast => "broadcast",
            AddressMode::Request => "request",
            AddressMode::DirectRequest => "direct_request",
            AddressMode::Directed => "directed",
            AddressMode::Reply => "reply",
        }
    }
}

/// A resolved destination: the topic to publish on and the reply-routing
/// header to attach, when the mode expects replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Destination topic.
    pub topic: String,
    /// Value for the reply-routing header, when the sender expects replies.
    pub reply_to: Option<String>,
}

/// Derives topics for one process.
///
/// The process identity and pid are explicit constructor arguments; the
/// resolver never reads ambient process state.
#[derive(Debug, Clone)]
pub struct TopicResolver {
    identity: String,
    pid: u32,
}

impl TopicResolver {
    /// A resolver for the process identified by `identity` and `pid`.
    #[must_use]
    pub fn new(identity: impl Into<String>, pid: u32) -> Self {
        Self {
            identity: identity.into(),
            pid,
        }
    }

    /// The per-process topic replies to this process arrive on.
    #[must_use]
    pub fn reply_topic(&self, collective: &str) -> String {
        format!("{collective} reply {} {}", self.identity, self.pid)
    }

    /// The topic a node subscribes to for messages addressed to itself.
    #[must_use]
    pub fn directed_topic(&self, collective: &str) -> String {
        format!("{collective} nodes {}", self.identity)
    }

    /// Resolve the envelope for one destination.
    ///
    /// `target` is consulted only for [`AddressMode::DirectRequest`];
    /// `carried_reply_to` only for [`AddressMode::Reply`], where it is the
    /// reply-routing header taken from the original request and becomes the
    /// destination topic verbatim.
    ///
    /// # Errors
    ///
    /// `ResolveError` when a direct request names no target or a reply
    /// carries no reply-routing header.
    pub fn resolve(
        &self,
        mode: AddressMode,
        collective: &str,
        agent: &str,
        target: Option<&str>,
        carried_reply_to: Option<&str>,
    ) -> Result<Envelope, ResolveError> {
        match mode {
            AddressMode::Broadcast | AddressMode::Request => Ok(Envelope {
                topic: format!("{collective} {agent}"),
                reply_to: Some(self.reply_topic(collective)),
            }),
            AddressMode::DirectRequest => {
                let target = target.ok_or(ResolveError::MissingTarget)?;
                Ok(Envelope {
                    topic: format!("{collective} nodes {target}"),
                    reply_to: Some(self.reply_topic(collective)),
                })
            }
            AddressMode::Directed => Ok(Envelope {
                topic: self.directed_topic(collective),
                reply_to: None,
            }),
            AddressMode::Reply => {
                let topic = carried_reply_to.ok_or(ResolveError::MissingReplyTo)?;
                Ok(Envelope {
                    topic: topic.to_string(),
                    reply_to: None,
                })
            }
        }
    }

    /// Resolve every envelope a publish of `message` must produce: one per
    /// discovered target for a direct request, one otherwise.
    ///
    /// # Errors
    ///
    /// See [`TopicResolver::resolve`].
    pub fn resolve_publish(&self, message: &Outbound) -> Result<Vec<Envelope>, ResolveError> {
        match message.mode {
            AddressMode::DirectRequest => message
                .targets
                .iter()
                .map(|target| {
                    self.resolve(
                        message.mode,
                        &message.collective,
                        &message.agent,
                        Some(target),
                        None,
                    )
                })
                .collect(),
            AddressMode::Reply => Ok(vec![self.resolve(
                message.mode,
                &message.collective,
                &message.agent,
                None,
                message.reply_to.as_deref(),
            )?]),
            AddressMode::Broadcast | AddressMode::Request | AddressMode::Directed => {
                Ok(vec![self.resolve(
                    message.mode,
                    &message.collective,
                    &message.agent,
                    None,
                    None,
                )?])
            }
        }
    }
}

/// Topic resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// An addressing mode name was not recognized
    #[error("unknown addressing mode '{0}'")]
    UnknownMode(String),
    /// A direct request resolution was asked for without a target
    #[error("direct request resolution requires a target identity")]
    MissingTarget,
    /// A reply message carried no reply-routing header to route back on
    #[error("reply message carries no reply-routing header")]
    MissingReplyTo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn resolver() -> TopicResolver {
        TopicResolver::new("node1", 4242)
    }

    #[test]
    fn broadcast_and_request_share_a_topic() {
        let r = resolver();
        let broadcast = r
            .resolve(AddressMode::Broadcast, "prod", "myagent", None, None)
            .unwrap();
        let request = r
            .resolve(AddressMode::Request, "prod", "myagent", None, None)
            .unwrap();

        assert_eq!(broadcast.topic, "prod myagent");
        assert_eq!(broadcast, request);
        assert_eq!(broadcast.reply_to.as_deref(), Some("prod reply node1 4242"));
    }

    #[test]
    fn directed_matches_a_direct_request_at_the_same_identity() {
        let r = resolver();
        let listening = r
            .resolve(AddressMode::Directed, "prod", "myagent", None, None)
            .unwrap();
        let sending = r
            .resolve(
                AddressMode::DirectRequest,
                "prod",
                "myagent",
                Some("node1"),
                None,
            )
            .unwrap();

        assert_eq!(listening.topic, "prod nodes node1");
        assert_eq!(listening.topic, sending.topic);
        assert_eq!(listening.reply_to, None);
        assert!(sending.reply_to.is_some());
    }

    #[test]
    fn reply_uses_the_carried_header_verbatim() {
        let r = resolver();
        let carried = "prod reply elsewhere 99";
        let envelope = r
            .resolve(AddressMode::Reply, "prod", "myagent", None, Some(carried))
            .unwrap();

        assert_eq!(envelope.topic, carried);
        assert_eq!(envelope.reply_to, None);
    }

    #[test]
    fn reply_without_carried_header_fails() {
        let err = resolver()
            .resolve(AddressMode::Reply, "prod", "myagent", None, None)
            .unwrap_err();
        assert_eq!(err, ResolveError::MissingReplyTo);
    }

    #[test]
    fn direct_request_publish_resolves_one_envelope_per_target() {
        let r = resolver();
        let message = Outbound::direct_request(
            "prod",
            "myagent",
            vec!["alpha".to_string(), "beta".to_string()],
            Bytes::from_static(b"ping"),
        );
        let envelopes = r.resolve_publish(&message).unwrap();

        let topics: Vec<&str> = envelopes.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, vec!["prod nodes alpha", "prod nodes beta"]);
        assert!(envelopes
            .iter()
            .all(|e| e.reply_to.as_deref() == Some("prod reply node1 4242")));
    }

    #[test]
    fn direct_request_publish_with_no_targets_resolves_nothing() {
        let r = resolver();
        let message =
            Outbound::direct_request("prod", "myagent", Vec::new(), Bytes::from_static(b"ping"));
        assert!(r.resolve_publish(&message).unwrap().is_empty());
    }

    #[test]
    fn mode_names_roundtrip() {
        for mode in [
            AddressMode::Broadcast,
            AddressMode::Request,
            AddressMode::DirectRequest,
            AddressMode::Directed,
            AddressMode::Reply,
        ] {
            assert_eq!(AddressMode::parse(mode.as_str()).unwrap(), mode);
        }
        assert_eq!(
            AddressMode::parse("multicast"),
            Err(ResolveError::UnknownMode("multicast".to_string()))
        );
    }
}
