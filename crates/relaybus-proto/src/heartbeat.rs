//! Heartbeat deadline arithmetic shared by both peers.
//!
//! The negotiated TTL is stretched asymmetrically: a peer expects to hear
//! something within 1.05×TTL but promises to send something within 0.95×TTL,
//! so modest clock drift between the two sides never races a keepalive
//! against an eviction.

use std::time::Duration;

/// Factor applied to the TTL for the receive deadline.
pub const RECV_GRACE: f64 = 1.05;

/// Factor applied to the TTL for the send deadline.
pub const SEND_LEAD: f64 = 0.95;

/// How long after the last receive a peer is considered gone.
#[must_use]
pub fn recv_deadline(ttl: Duration) -> Duration {
    ttl.mul_f64(RECV_GRACE)
}

/// How long after the last send a keepalive becomes due.
#[must_use]
pub fn send_deadline(ttl: Duration) -> Duration {
    ttl.mul_f64(SEND_LEAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_straddle_the_ttl() {
        let ttl = Duration::from_millis(1000);
        assert_eq!(recv_deadline(ttl), Duration::from_millis(1050));
        assert_eq!(send_deadline(ttl), Duration::from_millis(950));
        assert!(send_deadline(ttl) < ttl && ttl < recv_deadline(ttl));
    }
}
