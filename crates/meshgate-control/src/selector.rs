//! Route selection.
//!
//! Turns a client's requirements into a ranked set of candidate paths and a
//! single selected route with session credentials. Link measurements come
//! from an injected estimator so the ranking stays reproducible: for an
//! identical node snapshot and identical measurements, repeated calls
//! produce the same selection and the same ordering of alternates.
//!
//! Scoring (weights documented here, tests assert monotonicity only):
//!
//! ```text
//! cost     = latency_ms * 0.6 + (1000 / bandwidth_mbps) * 0.4
//! priority = 100
//!          + 40 if preferred country matches
//!          + 25 if preferred region matches
//!          + 20 if direct NAT pairing is feasible
//!          + 30 if the node can relay and the client is symmetric
//!          + min(spare_capacity / 4, 25)
//! ```
//!
//! Ranking is ascending cost, tie-broken by descending priority, then by
//! node id for determinism.

use crate::credentials::CredentialIssuer;
use crate::error::{ControlError, Result};
use crate::node::{NatType, Node};
use crate::registry::{CandidateFilter, NodeRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Client-side network facts attached to a route request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientNetworkInfo {
    /// Client's IPv4 address
    pub ipv4: String,
    /// Client's NAT classification
    pub nat_type: NatType,
    /// Externally visible address discovered via STUN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stun_mapped_address: Option<String>,
}

/// Optional constraints on the selected route
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    /// Minimum acceptable bandwidth in Mbps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_bandwidth: Option<f64>,
    /// Maximum acceptable latency in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<f64>,
    /// Preferred region, scored as a bonus, never mandatory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_location: Option<String>,
    /// Preferred country, scored as a bonus, never mandatory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_country: Option<String>,
}

/// A client's request for a path into the overlay; ephemeral, not persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Requesting client
    pub client_id: String,
    /// Pin the exit to a specific node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    /// Optional constraints
    #[serde(default)]
    pub requirements: Requirements,
    /// Client reachability facts
    pub client_network: ClientNetworkInfo,
}

/// How the candidate path reaches the exit node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// Direct tunnel from client to node
    Direct,
    /// Traffic carried over the relay channel
    Relayed,
}

/// A scored candidate path; immutable once produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCandidate {
    /// Candidate identifier, stable for a given node and request
    pub id: String,
    /// Path kind
    pub kind: RouteKind,
    /// Ordered node ids the path traverses
    pub path: Vec<String>,
    /// Measured latency estimate in milliseconds
    pub estimated_latency_ms: f64,
    /// Measured bandwidth estimate in Mbps
    pub estimated_bandwidth_mbps: f64,
    /// Weighted cost, lower is preferred
    pub cost: f64,
    /// Tie-break key, higher is preferred
    pub priority: u32,
}

/// Tunnel parameters handed off to the client's tunnel-interface manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Exit node's tunnel identity key
    pub server_public_key: String,
    /// Exit node's tunnel host
    pub server_endpoint: String,
    /// Exit node's tunnel port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    /// Routed prefixes; defaults to full-tunnel
    pub allowed_ips: String,
}

/// Full-tunnel default for `allowed_ips`
pub const ALLOWED_IPS_FULL_TUNNEL: &str = "0.0.0.0/0";

/// The exit endpoint of a selected route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Exit node id
    pub node_id: String,
    /// Whether a direct connection to the node is expected to work
    pub direct_connection: bool,
}

/// The chosen route plus everything the client needs to use it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedRoute {
    /// The winning candidate
    #[serde(flatten)]
    pub candidate: RouteCandidate,
    /// Relay channel endpoint on the exit node
    pub relay_endpoint: String,
    /// Exit endpoint summary
    pub node_endpoint: NodeEndpoint,
    /// Time-bounded session credential
    pub session_token: String,
    /// Session expiry (unix seconds); the route must be re-requested after
    pub expires_at: u64,
    /// Present when the node advertises a direct tunnel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_config: Option<TunnelConfig>,
}

/// Wire shape of a route response: ranked alternates plus the selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    /// Remaining candidates ranked by preference, selected route excluded
    pub routes: Vec<RouteCandidate>,
    /// The chosen route
    pub selected_route: SelectedRoute,
}

/// Link measurement estimate for one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkMetrics {
    /// Round-trip latency in milliseconds
    pub latency_ms: f64,
    /// Usable bandwidth in Mbps
    pub bandwidth_mbps: f64,
}

/// Measurement collaborator; external in production, fixed in tests
#[async_trait]
pub trait LinkEstimator: Send + Sync {
    /// Estimate the link between the client and a candidate node
    async fn estimate(&self, node: &Node, client: &ClientNetworkInfo) -> LinkMetrics;
}

/// Estimator that derives metrics from the node's advertised capacity
///
/// Latency falls back to a fixed figure; deployments inject a real prober.
pub struct AdvertisedCapacityEstimator {
    /// Latency assumed when no measurement is available
    pub default_latency_ms: f64,
}

impl Default for AdvertisedCapacityEstimator {
    fn default() -> Self {
        Self {
            default_latency_ms: 50.0,
        }
    }
}

#[async_trait]
impl LinkEstimator for AdvertisedCapacityEstimator {
    async fn estimate(&self, node: &Node, _client: &ClientNetworkInfo) -> LinkMetrics {
        LinkMetrics {
            latency_ms: self.default_latency_ms,
            bandwidth_mbps: f64::from(node.capabilities.bandwidth.up.min(node.capabilities.bandwidth.down)),
        }
    }
}

/// Selector tuning knobs
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Session credential lifetime in seconds
    pub session_ttl_seconds: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: 600,
        }
    }
}

/// Scores candidate nodes and issues the selected route
pub struct RouteSelector {
    registry: Arc<NodeRegistry>,
    issuer: Arc<CredentialIssuer>,
    estimator: Arc<dyn LinkEstimator>,
    config: SelectorConfig,
}

impl RouteSelector {
    /// Create a selector over the given registry, issuer and estimator
    pub fn new(
        registry: Arc<NodeRegistry>,
        issuer: Arc<CredentialIssuer>,
        estimator: Arc<dyn LinkEstimator>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry,
            issuer,
            estimator,
            config,
        }
    }

    /// Select a route for the request
    ///
    /// Fails with `NoViableRoute` when no candidate satisfies the mandatory
    /// constraints, and `Credential` when token issuance fails.
    pub async fn select_route(&self, request: &RouteRequest) -> Result<RouteResponse> {
        let filter = CandidateFilter {
            node_id: request.target_node_id.clone(),
            require_routing: request.target_node_id.is_none(),
            require_natting: request.client_network.nat_type.needs_relay(),
            country: None,
        };

        let nodes = self.registry.list_candidates(&filter).await?;
        if nodes.is_empty() {
            return Err(ControlError::NoViableRoute(
                "no online candidates satisfy the request".to_string(),
            ));
        }

        let mut scored: Vec<(Node, RouteCandidate)> = Vec::with_capacity(nodes.len());
        for node in nodes {
            let metrics = self.estimator.estimate(&node, &request.client_network).await;

            if let Some(min_bw) = request.requirements.min_bandwidth {
                if metrics.bandwidth_mbps < min_bw {
                    continue;
                }
            }
            if let Some(max_lat) = request.requirements.max_latency {
                if metrics.latency_ms > max_lat {
                    continue;
                }
            }

            let candidate = Self::score(&node, request, metrics);
            scored.push((node, candidate));
        }

        if scored.is_empty() {
            return Err(ControlError::NoViableRoute(
                "all candidates violate bandwidth/latency requirements".to_string(),
            ));
        }

        scored.sort_by(|(a_node, a), (b_node, b)| {
            a.cost
                .total_cmp(&b.cost)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a_node.node_id.cmp(&b_node.node_id))
        });

        let (node, candidate) = scored.remove(0);
        let alternates = scored.into_iter().map(|(_, c)| c).collect();

        let credential = self.issuer.issue(self.config.session_ttl_seconds)?;
        // "<expiry>:<nonce>:<hmac>" - the leading field keeps expiry
        // inspectable by transports without another parse format
        let session_token = format!("{}:{}", credential.username, credential.password);
        let expires_at = Self::unix_now().saturating_add(self.config.session_ttl_seconds);

        let tunnel_config = node.tunnel_endpoint().map(|(host, port)| TunnelConfig {
            server_public_key: node
                .capabilities
                .tunnel_public_key
                .clone()
                .unwrap_or_default(),
            server_endpoint: host,
            server_port: Some(port),
            allowed_ips: ALLOWED_IPS_FULL_TUNNEL.to_string(),
        });

        let direct_connection = request
            .client_network
            .nat_type
            .direct_feasible_with(node.network.nat_type)
            && tunnel_config.is_some();

        self.registry
            .attach_session(&node.node_id, &session_token, expires_at)
            .await?;

        debug!(
            client_id = %request.client_id,
            node_id = %node.node_id,
            cost = candidate.cost,
            "route selected"
        );

        let selected_route = SelectedRoute {
            candidate,
            relay_endpoint: format!(
                "wss://{}:{}/relay",
                node.network.ipv4, node.network.local_port
            ),
            node_endpoint: NodeEndpoint {
                node_id: node.node_id.clone(),
                direct_connection,
            },
            session_token,
            expires_at,
            tunnel_config,
        };

        Ok(RouteResponse {
            routes: alternates,
            selected_route,
        })
    }

    /// Score one candidate node
    fn score(node: &Node, request: &RouteRequest, metrics: LinkMetrics) -> RouteCandidate {
        let cost =
            metrics.latency_ms * 0.6 + (1000.0 / metrics.bandwidth_mbps.max(0.1)) * 0.4;

        let mut priority: u32 = 100;
        if let Some(country) = &request.requirements.preferred_country {
            if node.location.country.eq_ignore_ascii_case(country) {
                priority += 40;
            }
        }
        if let Some(region) = &request.requirements.preferred_location {
            if node.location.region.eq_ignore_ascii_case(region) {
                priority += 25;
            }
        }
        let direct_feasible = request
            .client_network
            .nat_type
            .direct_feasible_with(node.network.nat_type);
        if direct_feasible {
            priority += 20;
        }
        if request.client_network.nat_type == NatType::Symmetric && node.capabilities.natting {
            priority += 30;
        }
        priority += (node.spare_capacity() / 4).min(25);

        let kind = if direct_feasible && node.capabilities.supports_tunnel() {
            RouteKind::Direct
        } else {
            RouteKind::Relayed
        };

        RouteCandidate {
            id: format!("rt-{}-{}", request.client_id, node.node_id),
            kind,
            path: vec![node.node_id.clone()],
            estimated_latency_ms: metrics.latency_ms,
            estimated_bandwidth_mbps: metrics.bandwidth_mbps,
            cost,
            priority,
        }
    }

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
