//! Relay wire protocol.
//!
//! A single relay connection multiplexes two payload shapes:
//!
//! - raw tunnel packets (binary), recognized by a leading byte in the
//!   tunnel protocol's reserved message-type range
//! - JSON control envelopes (`packet`, `ping`, `pong`, `error`, ...)
//!
//! The discrimination is a heuristic, not a self-describing protocol: peers
//! on the wire today rely on the reserved-byte range, so it must be
//! preserved byte-for-byte unless the wire format is redesigned wholesale.
//! Anything that fails JSON parsing is passed through as an opaque packet -
//! data is never dropped silently.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved leading bytes for tunnel protocol messages
///
/// Matches the four WireGuard message types (handshake initiation/response,
/// cookie reply, transport data).
pub const TUNNEL_TYPE_MIN: u8 = 1;
/// Upper bound of the reserved range, inclusive
pub const TUNNEL_TYPE_MAX: u8 = 4;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Control envelope failed to serialize
    #[error("encode error: {0}")]
    Encode(String),

    /// A `packet` envelope carried undecodable payload
    #[error("invalid packet payload: {0}")]
    InvalidPayload(String),
}

/// Typed control messages carried as JSON text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ControlEnvelope {
    /// Tunnel packet carried inside JSON (base64) when binary framing is
    /// unavailable
    Packet {
        /// base64-encoded packet bytes
        data: String,
        /// Session the packet belongs to
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Liveness probe
    Ping,
    /// Liveness reply
    Pong,
    /// Server-reported fault; surfaced to the caller, the connection is not
    /// closed on this alone
    Error {
        /// Human-readable fault description
        data: String,
    },
    /// Node announces its tunnel endpoint over the relay channel
    Register {
        /// Announcing node
        node_id: String,
        /// Tunnel endpoint (`host:port`)
        endpoint: String,
    },
    /// Relay acknowledges a registration
    Registered {
        /// Session the registration was bound to
        session_id: String,
    },
}

impl ControlEnvelope {
    /// Wrap raw packet bytes as a base64 `packet` envelope
    #[must_use]
    pub fn packet(bytes: &[u8], session_id: Option<String>) -> Self {
        use base64::Engine;
        ControlEnvelope::Packet {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            session_id,
        }
    }

    /// Serialize to the JSON text carried on the wire
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode the payload of a `packet` envelope
    pub fn decode_packet(&self) -> Result<Bytes, ProtocolError> {
        use base64::Engine;
        match self {
            ControlEnvelope::Packet { data, .. } => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map(Bytes::from)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string())),
            _ => Err(ProtocolError::InvalidPayload(
                "not a packet envelope".to_string(),
            )),
        }
    }
}

/// A classified inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// Opaque tunnel packet, forwarded without inspection
    Packet(Bytes),
    /// Parsed control envelope
    Control(ControlEnvelope),
}

/// Classify an inbound payload
///
/// Leading byte in the reserved tunnel range -> raw packet. Otherwise the
/// payload is parsed as a JSON control envelope; parse failure falls back
/// to an opaque packet (permissive passthrough).
#[must_use]
pub fn classify(payload: &[u8]) -> RelayFrame {
    if let Some(&first) = payload.first() {
        if (TUNNEL_TYPE_MIN..=TUNNEL_TYPE_MAX).contains(&first) {
            return RelayFrame::Packet(Bytes::copy_from_slice(payload));
        }
    }

    match serde_json::from_slice::<ControlEnvelope>(payload) {
        Ok(envelope) => RelayFrame::Control(envelope),
        Err(_) => RelayFrame::Packet(Bytes::copy_from_slice(payload)),
    }
}
