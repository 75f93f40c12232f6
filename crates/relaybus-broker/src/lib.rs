//! # relaybus Broker
//!
//! Topic fan-out broker for the relaybus pub/sub protocol.
//!
//! The broker owns one ROUTER-style socket and runs four cooperating tasks:
//! 1. **Pump**: decodes each inbound frame sequence, applies the verb to the
//!    client registry, forwards publications, and upholds the
//!    acknowledgement contract
//! 2. **Keepalive scan**: sends NOOPs to clients whose send deadline passed
//! 3. **Eviction scan**: drops clients whose receive deadline passed
//! 4. **Status**: periodically logs client and traffic counters

pub mod config;
mod heartbeat;
mod registry;
mod router;

pub use config::BrokerConfig;
pub use router::Broker;
