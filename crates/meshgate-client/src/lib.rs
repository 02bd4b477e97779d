//! # Meshgate Client
//!
//! Client session machinery for the meshgate overlay VPN.
//!
//! This crate provides:
//! - The connection orchestrator: a multi-phase state machine sequencing
//!   health check, network discovery, route request, tunnel setup, relay
//!   fallback and traffic bridging
//! - Tunnel lifecycle management over an injected interface manager
//! - The control-plane API contract with its HTTP implementation
//!
//! ## Session shape
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                 ConnectionOrchestrator                    │
//! │   Disconnected -> Connecting (7 phases) -> Connected      │
//! ├─────────────────────────────┬─────────────────────────────┤
//! │        TunnelSession        │       RelayTransport        │
//! │   (direct encrypted path)   │   (WebSocket fallback)      │
//! └─────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! Either leg may be missing: a session with only a tunnel or only a relay
//! still reports `Connected`, degraded rather than failed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod error;
pub mod orchestrator;
pub mod tunnel;

pub use api::{ControlApi, HealthReply, HttpControlApi, NetworkDiscovery};
pub use error::{ClientError, Result};
pub use orchestrator::{
    ClientStatus, ConnectionEvent, ConnectionOrchestrator, ConnectionState, OrchestratorConfig,
};
pub use tunnel::{TunnelDevice, TunnelSession, TunnelState, TunnelStats};
