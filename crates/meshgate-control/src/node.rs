//! Node data model for the overlay registry.
//!
//! A `Node` is a registered overlay peer: its tunnel identity key, network
//! reachability (including NAT classification), advertised capabilities and
//! coarse location. Liveness is *computed at read time* from the last
//! heartbeat - a stored record may still say `Online` while readers must
//! already treat the node as `Offline`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// NAT type classification
///
/// Determines direct-connectivity feasibility between two peers:
/// - Open / Full Cone: easy to reach, any external host can send
/// - Restricted / Port Restricted: requires coordinated open
/// - Symmetric: different mapping per destination, direct pairing with
///   another symmetric peer is infeasible and needs a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    /// No NAT, publicly reachable
    Open,
    /// Full Cone NAT
    FullCone,
    /// Restricted Cone NAT
    RestrictedCone,
    /// Port Restricted Cone NAT
    PortRestricted,
    /// Symmetric NAT
    Symmetric,
    /// Detection failed or not yet run
    Unknown,
}

impl NatType {
    /// Whether a direct tunnel between these two NAT types is feasible
    ///
    /// Symmetric-to-symmetric pairing is the one combination with no
    /// practical hole-punching strategy.
    #[must_use]
    pub fn direct_feasible_with(self, other: NatType) -> bool {
        !(self == NatType::Symmetric && other == NatType::Symmetric)
            && self != NatType::Unknown
            && other != NatType::Unknown
    }

    /// Whether this endpoint should be paired with a relay-capable node
    #[must_use]
    pub fn needs_relay(self) -> bool {
        matches!(self, NatType::Symmetric | NatType::Unknown)
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::FullCone => write!(f, "Full Cone"),
            Self::RestrictedCone => write!(f, "Restricted Cone"),
            Self::PortRestricted => write!(f, "Port Restricted"),
            Self::Symmetric => write!(f, "Symmetric"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Node availability as stored in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Accepting sessions
    Online,
    /// Not accepting sessions
    Offline,
    /// Reachable but impaired
    Degraded,
}

/// Network reachability of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Primary IPv4 address
    pub ipv4: String,
    /// Optional IPv6 address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    /// NAT classification from the node's own detection
    pub nat_type: NatType,
    /// Externally visible address discovered via STUN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stun_mapped_address: Option<String>,
    /// Port the node listens on locally
    pub local_port: u16,
}

/// Up/down link capacity in Mbps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    /// Upstream capacity
    pub up: u32,
    /// Downstream capacity
    pub down: u32,
}

/// Capabilities a node advertises at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Maximum concurrent client sessions
    pub max_connections: u32,
    /// Advertised link capacity
    pub bandwidth: Bandwidth,
    /// Can forward traffic for other peers
    pub routing: bool,
    /// Can serve as a NAT relay for symmetric clients
    pub natting: bool,
    /// Tunnel identity key, present when the node accepts direct tunnels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_public_key: Option<String>,
    /// Tunnel listen port, defaults to `local_port` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_port: Option<u16>,
}

impl Capabilities {
    /// Whether the node advertises a direct-tunnel endpoint
    #[must_use]
    pub fn supports_tunnel(&self) -> bool {
        self.tunnel_public_key.is_some()
    }
}

/// Coarse geographic placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// ISO country code
    pub country: String,
    /// Free-form region name
    pub region: String,
    /// `[lat, lon]`
    pub coordinates: [f64; 2],
}

/// A registered overlay peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable unique identifier, immutable after creation
    pub node_id: String,
    /// Tunnel identity key (opaque)
    pub public_key: String,
    /// Network reachability
    pub network: NetworkInfo,
    /// Advertised capabilities
    pub capabilities: Capabilities,
    /// Geographic placement
    pub location: Location,
    /// Stored availability; readers must apply `effective_status`
    pub status: NodeStatus,
    /// Registration time (unix seconds)
    pub registered_at: u64,
    /// Last heartbeat time (unix seconds), monotone non-decreasing
    pub last_heartbeat: u64,
    /// Client sessions currently routed through this node
    #[serde(default)]
    pub active_sessions: u32,
    /// Session token once a client is actively routed through this node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Expiry of the attached session (unix seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Node {
    /// Whether the node has missed heartbeats beyond the liveness window
    #[must_use]
    pub fn is_stale(&self, now: u64, liveness_window_secs: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) > liveness_window_secs
    }

    /// Availability as readers must see it
    ///
    /// A stored `Online` beyond the liveness window reads as `Offline`;
    /// staleness is never eagerly pushed back into the store.
    #[must_use]
    pub fn effective_status(&self, now: u64, liveness_window_secs: u64) -> NodeStatus {
        if self.is_stale(now, liveness_window_secs) {
            NodeStatus::Offline
        } else {
            self.status
        }
    }

    /// Session slots left before `max_connections`
    #[must_use]
    pub fn spare_capacity(&self) -> u32 {
        self.capabilities
            .max_connections
            .saturating_sub(self.active_sessions)
    }

    /// Endpoint for the direct tunnel, when advertised
    #[must_use]
    pub fn tunnel_endpoint(&self) -> Option<(String, u16)> {
        self.capabilities.tunnel_public_key.as_ref()?;
        let port = self
            .capabilities
            .tunnel_port
            .unwrap_or(self.network.local_port);
        Some((self.network.ipv4.clone(), port))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_node(id: &str) -> Node {
        Node {
            node_id: id.to_string(),
            public_key: format!("pk-{id}"),
            network: NetworkInfo {
                ipv4: "203.0.113.10".to_string(),
                ipv6: None,
                nat_type: NatType::FullCone,
                stun_mapped_address: None,
                local_port: 51820,
            },
            capabilities: Capabilities {
                max_connections: 64,
                bandwidth: Bandwidth { up: 100, down: 100 },
                routing: true,
                natting: true,
                tunnel_public_key: Some(format!("tunnel-pk-{id}")),
                tunnel_port: None,
            },
            location: Location {
                country: "DE".to_string(),
                region: "eu-central".to_string(),
                coordinates: [50.1, 8.7],
            },
            status: NodeStatus::Online,
            registered_at: 1_000,
            last_heartbeat: 1_000,
            active_sessions: 0,
            session_token: None,
            expires_at: None,
        }
    }

    #[test]
    fn test_nat_direct_feasibility() {
        assert!(NatType::FullCone.direct_feasible_with(NatType::Symmetric));
        assert!(NatType::Symmetric.direct_feasible_with(NatType::FullCone));
        assert!(!NatType::Symmetric.direct_feasible_with(NatType::Symmetric));
        assert!(!NatType::Unknown.direct_feasible_with(NatType::FullCone));
    }

    #[test]
    fn test_nat_needs_relay() {
        assert!(NatType::Symmetric.needs_relay());
        assert!(NatType::Unknown.needs_relay());
        assert!(!NatType::PortRestricted.needs_relay());
    }

    #[test]
    fn test_effective_status_staleness() {
        let node = test_node("n1");
        assert_eq!(node.effective_status(1_050, 90), NodeStatus::Online);
        // Past the liveness window the stored Online reads as Offline
        assert_eq!(node.effective_status(1_200, 90), NodeStatus::Offline);
    }

    #[test]
    fn test_spare_capacity_saturates() {
        let mut node = test_node("n1");
        node.active_sessions = 70;
        assert_eq!(node.spare_capacity(), 0);
        node.active_sessions = 10;
        assert_eq!(node.spare_capacity(), 54);
    }

    #[test]
    fn test_tunnel_endpoint_defaults_to_local_port() {
        let mut node = test_node("n1");
        assert_eq!(
            node.tunnel_endpoint(),
            Some(("203.0.113.10".to_string(), 51820))
        );

        node.capabilities.tunnel_port = Some(51821);
        assert_eq!(node.tunnel_endpoint().unwrap().1, 51821);

        node.capabilities.tunnel_public_key = None;
        assert!(node.tunnel_endpoint().is_none());
    }

    #[test]
    fn test_node_serde_roundtrip() {
        let node = test_node("n1");
        let json = serde_json::to_string(&node).unwrap();
        let decoded: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(node, decoded);
    }
}
