//! # relaybus Protocol
//!
//! Wire protocol, topic resolution, and command correlation for the relaybus
//! pub/sub system.
//!
//! This crate provides:
//! - Frame-level codec for the verb grammar exchanged between broker and
//!   clients (multipart byte frames, flattened header pairs, opaque bodies)
//! - Topic derivation for the addressing modes (broadcast, request, direct
//!   request, directed, reply) and reply routing
//! - Command-id generation and acknowledgement verification
//! - Heartbeat deadline arithmetic shared by both peers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod heartbeat;
pub mod message;
pub mod topics;
pub mod wire;

pub use command::{next_command_id, verify_ack, AckError};
pub use message::{Delivery, Outbound};
pub use topics::{AddressMode, Envelope, ResolveError, TopicResolver};
pub use wire::{header, Headers, Packet, ProtocolError, Verb, PROTOCOL_VERSION};
