//! # Meshgate Control
//!
//! Control plane for the meshgate overlay VPN.
//!
//! This crate provides:
//! - Node registry with cache-aside lookups and read-time staleness
//! - Route selection over a scored candidate set
//! - Short-lived TURN-style relay credentials (HMAC-SHA1, time-windowed)
//! - Storage contracts for the durable store and fast cache collaborators
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      RouteSelector                         │
//! │     (scores candidates, mints session credentials)         │
//! ├──────────────────────────────┬─────────────────────────────┤
//! │         NodeRegistry         │      CredentialIssuer       │
//! │  (cache-aside, heartbeats)   │   (HMAC-signed, expiring)   │
//! ├──────────────────────────────┴─────────────────────────────┤
//! │                  NodeStore / NodeCache                     │
//! │        (durable source of truth / TTL optimization)        │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Route selection is a local scoring heuristic over a bounded candidate
//! set; this is not a traffic-engineering optimizer and control-plane
//! replicas do not coordinate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod credentials;
pub mod error;
pub mod node;
pub mod registry;
pub mod selector;
pub mod store;

pub use credentials::{CredentialIssuer, RelayCredential};
pub use error::{ControlError, Result};
pub use node::{Bandwidth, Capabilities, Location, NatType, NetworkInfo, Node, NodeStatus};
pub use registry::{CandidateFilter, NodeRegistry, RegistryConfig};
pub use selector::{
    ClientNetworkInfo, LinkEstimator, LinkMetrics, NodeEndpoint, Requirements, RouteCandidate,
    RouteKind, RouteRequest, RouteResponse, RouteSelector, SelectedRoute, SelectorConfig,
    TunnelConfig,
};
pub use store::{MemoryNodeCache, MemoryNodeStore, NodeCache, NodeStore};
