//! Command identifiers and acknowledgement correlation.
//!
//! Every mutating command (CONNECT, SUB, UNSUB) carries a unique id in its
//! `ID` header; the broker echoes it in the `OK` (or `ERROR`) reply. The
//! issuing side blocks on the next inbound frame sequence and accepts only a
//! matching acknowledgement — an interleaved unrelated frame is a protocol
//! violation, not something to skip past.

use uuid::Uuid;

use crate::wire::{header, Packet, Verb};

/// Generate a globally-unique id for a mutating command.
#[must_use]
pub fn next_command_id() -> String {
    Uuid::new_v4().to_string()
}

/// Why an inbound frame sequence failed to acknowledge a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    /// The broker rejected the command
    #[error("broker replied ERROR: {text}")]
    Rejected {
        /// Error text reported by the broker.
        text: String,
    },
    /// An unrelated verb arrived where the acknowledgement was expected
    #[error("expected OK, got '{verb}'")]
    UnexpectedVerb {
        /// The verb that arrived instead.
        verb: String,
    },
    /// The acknowledgement carried no command id
    #[error("acknowledgement carried no command id")]
    MissingId,
    /// The acknowledgement echoed a different command id
    #[error("acknowledgement id mismatch: expected {expected}, got {got}")]
    IdMismatch {
        /// The id the command was issued with.
        expected: String,
        /// The id the acknowledgement carried.
        got: String,
    },
}

/// Check that `packet` acknowledges the command issued with `id`.
///
/// # Errors
///
/// `AckError` describing the first way the packet fails to match.
pub fn verify_ack(packet: &Packet, id: &str) -> Result<(), AckError> {
    match packet.kind() {
        Some(Verb::Ok) => {}
        Some(Verb::Error) => {
            return Err(AckError::Rejected {
                text: packet
                    .headers
                    .get(header::MESSAGE)
                    .unwrap_or("unspecified error")
                    .to_string(),
            });
        }
        _ => {
            return Err(AckError::UnexpectedVerb {
                verb: packet.verb.clone(),
            });
        }
    }

    match packet.headers.command_id() {
        None => Err(AckError::MissingId),
        Some(got) if got == id => Ok(()),
        Some(got) => Err(AckError::IdMismatch {
            expected: id.to_string(),
            got: got.to_string(),
        }),
    }
}
