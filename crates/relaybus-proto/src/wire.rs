//! Frame-level wire codec.
//!
//! Every exchange is one multipart message: the first frame is the verb,
//! header pairs follow flattened as `k1, v1, k2, v2, ...`, and an empty
//! frame separates the headers from the opaque body frames. Verbs that carry
//! no body omit the separator, so a decoder treats a sequence with no empty
//! frame as headers-only.
//!
//! The router side of the transport prepends the sender's connection
//! identity to inbound sequences; that frame is stripped before the codec
//! ever sees it.

use std::fmt;

use bytes::Bytes;

/// Protocol version advertised in the `VERSION` header at CONNECT.
pub const PROTOCOL_VERSION: &str = "0.2";

/// Known header names.
pub mod header {
    /// Protocol version, sent once at CONNECT.
    pub const VERSION: &str = "VERSION";
    /// Heartbeat interval in milliseconds, negotiated at CONNECT.
    pub const TTL: &str = "TTL";
    /// Command correlation id, echoed in acknowledgements.
    pub const ID: &str = "ID";
    /// Destination topic of a PUT or MESSAGE.
    pub const TOPIC: &str = "TOPIC";
    /// Reply-routing topic carried on requests.
    pub const REPLY_TO: &str = "X-REPLY-TO";
    /// Human-readable text on ERROR replies.
    pub const MESSAGE: &str = "MESSAGE";
}

/// Protocol verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Open a session; carries VERSION, TTL, and a command id.
    Connect,
    /// Close a session; never acknowledged.
    Disconnect,
    /// Add the body topics to the sender's subscription set.
    Sub,
    /// Remove the body topics from the sender's subscription set.
    Unsub,
    /// Publish a payload to the TOPIC header's subscribers.
    Put,
    /// Keepalive; refreshes the peer's receive deadline and nothing else.
    Noop,
    /// A delivered publication, broker to client.
    Message,
    /// Positive acknowledgement echoing a command id.
    Ok,
    /// Failure report, optionally echoing a command id.
    Error,
}

impl Verb {
    /// Wire spelling of the verb.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Connect => "CONNECT",
            Verb::Disconnect => "DISCONNECT",
            Verb::Sub => "SUB",
            Verb::Unsub => "UNSUB",
            Verb::Put => "PUT",
            Verb::Noop => "NOOP",
            Verb::Message => "MESSAGE",
            Verb::Ok => "OK",
            Verb::Error => "ERROR",
        }
    }

    /// Parse a wire verb.
    ///
    /// Returns `None` for verbs this implementation does not know; the
    /// broker reports those back to the sender in an ERROR reply.
    #[must_use]
    pub fn parse(verb: &str) -> Option<Self> {
        match verb {
            "CONNECT" => Some(Verb::Connect),
            "DISCONNECT" => Some(Verb::Disconnect),
            "SUB" => Some(Verb::Sub),
            "UNSUB" => Some(Verb::Unsub),
            "PUT" => Some(Verb::Put),
            "NOOP" => Some(Verb::Noop),
            "MESSAGE" => Some(Verb::Message),
            "OK" => Some(Verb::Ok),
            "ERROR" => Some(Verb::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed-schema key/value header list.
///
/// Headers are conceptually unordered but flatten onto the wire as
/// alternating name and value frames, so the list form round-trips exactly.
/// Setting a name that is already present replaces its value, and a decoded
/// duplicate resolves to the last occurrence.
///
/// Header values must not be empty strings: an empty frame is the
/// header/body separator on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value under the same name.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    /// Value of a header, when present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Remove a header, returning whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        self.entries.len() != before
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The command correlation id, when present.
    #[must_use]
    pub fn command_id(&self) -> Option<&str> {
        self.get(header::ID)
    }

    /// The destination topic, when present.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.get(header::TOPIC)
    }

    /// The reply-routing topic, when present.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.get(header::REPLY_TO)
    }

    /// The advertised protocol version, when present.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.get(header::VERSION)
    }

    /// The heartbeat interval in milliseconds, when present.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidTtl` when the header is present but does not
    /// parse as a millisecond count.
    pub fn ttl_ms(&self) -> Result<Option<u64>, ProtocolError> {
        match self.get(header::TTL) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ProtocolError::InvalidTtl(raw.to_string())),
        }
    }
}

/// A decoded frame sequence: verb, headers, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Wire verb, preserved verbatim so unknown verbs can be reported.
    pub verb: String,
    /// Header set.
    pub headers: Headers,
    /// Opaque body frames.
    pub body: Vec<Bytes>,
}

impl Packet {
    /// Build a packet for a known verb.
    #[must_use]
    pub fn new(verb: Verb, headers: Headers, body: Vec<Bytes>) -> Self {
        Self {
            verb: verb.as_str().to_string(),
            headers,
            body,
        }
    }

    /// A bare control packet with no headers or body.
    #[must_use]
    pub fn bare(verb: Verb) -> Self {
        Self::new(verb, Headers::new(), Vec::new())
    }

    /// The parsed verb, or `None` when the peer sent something unknown.
    #[must_use]
    pub fn kind(&self) -> Option<Verb> {
        Verb::parse(&self.verb)
    }

    /// Flatten into the wire frame sequence.
    ///
    /// The header/body separator is emitted only when a body is present,
    /// matching the verb grammar (CONNECT, OK, and ERROR carry headers but
    /// no separator).
    #[must_use]
    pub fn encode(&self) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(2 + self.headers.len() * 2 + self.body.len());
        frames.push(Bytes::copy_from_slice(self.verb.as_bytes()));
        for (name, value) in self.headers.iter() {
            frames.push(Bytes::copy_from_slice(name.as_bytes()));
            frames.push(Bytes::copy_from_slice(value.as_bytes()));
        }
        if !self.body.is_empty() {
            frames.push(Bytes::new());
            frames.extend(self.body.iter().cloned());
        }
        frames
    }

    /// Parse a frame sequence.
    ///
    /// Frames before the first empty frame are the flattened header list;
    /// frames after it are the body. A sequence with no empty frame decodes
    /// as headers-only.
    ///
    /// # Errors
    ///
    /// `ProtocolError` when the sequence is empty, the verb or a header
    /// frame is not UTF-8, or the header frames do not pair up.
    pub fn decode(frames: Vec<Bytes>) -> Result<Self, ProtocolError> {
        let mut frames = frames.into_iter();
        let verb = frames.next().ok_or(ProtocolError::Empty)?;
        let verb = utf8_frame(&verb, "verb")?.to_string();

        let rest: Vec<Bytes> = frames.collect();
        let (header_frames, body) = match rest.iter().position(Bytes::is_empty) {
            Some(separator) => (&rest[..separator], rest[separator + 1..].to_vec()),
            None => (&rest[..], Vec::new()),
        };

        if header_frames.len() % 2 != 0 {
            return Err(ProtocolError::UnpairedHeaders {
                count: header_frames.len(),
            });
        }

        let mut headers = Headers::new();
        for pair in header_frames.chunks_exact(2) {
            let name = utf8_frame(&pair[0], "header name")?;
            let value = utf8_frame(&pair[1], "header value")?;
            headers.set(name, value);
        }

        Ok(Self {
            verb,
            headers,
            body,
        })
    }
}

fn utf8_frame<'a>(frame: &'a Bytes, context: &'static str) -> Result<&'a str, ProtocolError> {
    std::str::from_utf8(frame).map_err(|_| ProtocolError::NotUtf8 { context })
}

/// Malformed frame grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame sequence contained no verb frame
    #[error("empty frame sequence")]
    Empty,
    /// A verb or header frame was not valid UTF-8
    #[error("{context} frame is not valid UTF-8")]
    NotUtf8 {
        /// Which frame failed to decode.
        context: &'static str,
    },
    /// The header frames before the separator did not pair up
    #[error("odd number of header frames before separator: {count}")]
    UnpairedHeaders {
        /// How many frames preceded the separator.
        count: usize,
    },
    /// A TTL header did not parse as milliseconds
    #[error("invalid TTL header: '{0}'")]
    InvalidTtl(String),
}
