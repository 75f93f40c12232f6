//! Publish-side and delivery-side message envelopes.
//!
//! Payloads are opaque to the protocol layer; the surrounding framework
//! constructs and interprets the bytes.

use bytes::Bytes;

use crate::topics::AddressMode;

/// An outbound message handed to `publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Addressing mode.
    pub mode: AddressMode,
    /// Collective (topic namespace) the message belongs to.
    pub collective: String,
    /// Destination agent name; unused for directed and reply modes.
    pub agent: String,
    /// Explicit target identities, consulted for direct requests only.
    pub targets: Vec<String>,
    /// Reply-routing header carried over from the original request; set for
    /// replies only.
    pub reply_to: Option<String>,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Outbound {
    /// A broadcast to every subscriber of the agent's topic.
    #[must_use]
    pub fn broadcast(
        collective: impl Into<String>,
        agent: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            mode: AddressMode::Broadcast,
            collective: collective.into(),
            agent: agent.into(),
            targets: Vec::new(),
            reply_to: None,
            payload,
        }
    }

    /// A request; addressed like a broadcast.
    #[must_use]
    pub fn request(
        collective: impl Into<String>,
        agent: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            mode: AddressMode::Request,
            ..Self::broadcast(collective, agent, payload)
        }
    }

    /// A request addressed to an explicit set of target identities.
    #[must_use]
    pub fn direct_request(
        collective: impl Into<String>,
        agent: impl Into<String>,
        targets: Vec<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            mode: AddressMode::DirectRequest,
            targets,
            ..Self::broadcast(collective, agent, payload)
        }
    }

    /// A reply, routed on the reply-routing header carried by the original
    /// request.
    #[must_use]
    pub fn reply(
        collective: impl Into<String>,
        carried_reply_to: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            mode: AddressMode::Reply,
            collective: collective.into(),
            agent: String::new(),
            targets: Vec::new(),
            reply_to: Some(carried_reply_to.into()),
            payload,
        }
    }
}

/// A message delivered by `receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the message arrived on.
    pub topic: String,
    /// Reply-routing topic for responses, when the sender expects one.
    pub reply_to: Option<String>,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_the_mode() {
        let payload = Bytes::from_static(b"x");
        assert_eq!(
            Outbound::broadcast("prod", "a", payload.clone()).mode,
            AddressMode::Broadcast
        );
        assert_eq!(
            Outbound::request("prod", "a", payload.clone()).mode,
            AddressMode::Request
        );

        let direct =
            Outbound::direct_request("prod", "a", vec!["n1".to_string()], payload.clone());
        assert_eq!(direct.mode, AddressMode::DirectRequest);
        assert_eq!(direct.targets, vec!["n1".to_string()]);

        let reply = Outbound::reply("prod", "prod reply n 1", payload);
        assert_eq!(reply.mode, AddressMode::Reply);
        assert_eq!(reply.reply_to.as_deref(), Some("prod reply n 1"));
    }
}
