//! # Meshgate Relay
//!
//! Relay transport for the meshgate overlay VPN.
//!
//! This crate provides:
//! - The relay wire protocol: binary tunnel packets and JSON control
//!   envelopes multiplexed on one channel, discriminated by a reserved
//!   leading-byte range
//! - The client transport state machine over a persistent WebSocket, with
//!   heartbeat, read-timeout liveness, and single-shot reconnect scheduling
//!
//! The transport is a pure protocol engine: it knows nothing about routes
//! or registries and is driven entirely by its owner.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod protocol;
pub mod transport;

pub use protocol::{ControlEnvelope, ProtocolError, RelayFrame, classify};
pub use transport::{
    RelayConfig, RelayError, RelayEvent, RelayState, RelayTransport, token_expiry,
    token_is_expired,
};
