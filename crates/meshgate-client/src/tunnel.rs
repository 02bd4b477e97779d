//! Direct tunnel lifecycle.
//!
//! `TunnelSession` owns the client side of the encrypted tunnel: which keys
//! and peer parameters are installed, whether the interface is up, and the
//! liveness stats the orchestrator reads. Actual interface programming
//! (key install, peer/endpoint/allowed-IP configuration) is delegated to an
//! injected [`TunnelDevice`] - the data plane is not reimplemented here.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use meshgate_control::selector::TunnelConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Counters and handshake age reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Seconds since the last completed handshake, if any
    pub last_handshake_age_secs: Option<u64>,
    /// Bytes sent through the tunnel
    pub tx_bytes: u64,
    /// Bytes received through the tunnel
    pub rx_bytes: u64,
}

/// Tunnel interface manager collaborator
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Install keys and peer parameters
    async fn configure(&self, config: &TunnelConfig) -> Result<()>;

    /// Bring the interface up
    async fn up(&self) -> Result<()>;

    /// Tear the interface down
    async fn down(&self) -> Result<()>;

    /// Current device counters
    async fn stats(&self) -> Result<TunnelStats>;

    /// The tunnel's local UDP endpoint (`host:port`), once bound
    async fn local_endpoint(&self) -> Option<String>;

    /// Feed a packet that arrived over the relay fallback into the tunnel
    async fn inject_packet(&self, packet: &[u8]) -> Result<()>;
}

/// Lifecycle state of the session's tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No configuration installed
    Down,
    /// Keys installed, interface not yet up
    Configured,
    /// Interface up
    Up,
}

/// Client-side tunnel lifecycle and liveness
pub struct TunnelSession {
    device: Arc<dyn TunnelDevice>,
    state: RwLock<TunnelState>,
    config: RwLock<Option<TunnelConfig>>,
}

impl TunnelSession {
    /// Create a session over the given device
    pub fn new(device: Arc<dyn TunnelDevice>) -> Self {
        Self {
            device,
            state: RwLock::new(TunnelState::Down),
            config: RwLock::new(None),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> TunnelState {
        *self.state.read().await
    }

    /// The installed configuration, if any
    pub async fn config(&self) -> Option<TunnelConfig> {
        self.config.read().await.clone()
    }

    /// Configure and bring the tunnel up
    ///
    /// Device failures propagate; the session stays in whatever state the
    /// device left it (`Down` on configure failure, `Configured` on up
    /// failure) so teardown still runs cleanly.
    pub async fn establish(&self, config: TunnelConfig) -> Result<()> {
        self.device.configure(&config).await?;
        *self.config.write().await = Some(config);
        *self.state.write().await = TunnelState::Configured;

        self.device.up().await?;
        *self.state.write().await = TunnelState::Up;
        debug!("tunnel established");
        Ok(())
    }

    /// Tear the tunnel down
    ///
    /// Idempotent; a device failure is logged, the session still resets so
    /// teardown always completes.
    pub async fn teardown(&self) {
        if *self.state.read().await == TunnelState::Down {
            return;
        }
        if let Err(e) = self.device.down().await {
            warn!(error = %e, "tunnel device down failed");
        }
        *self.state.write().await = TunnelState::Down;
        *self.config.write().await = None;
        debug!("tunnel torn down");
    }

    /// Device counters
    pub async fn stats(&self) -> Result<TunnelStats> {
        self.device.stats().await
    }

    /// The tunnel's local endpoint, once bound
    pub async fn local_endpoint(&self) -> Option<String> {
        self.device.local_endpoint().await
    }

    /// Whether the tunnel is up with a recent handshake
    pub async fn is_established(&self, handshake_window: Duration) -> bool {
        if *self.state.read().await != TunnelState::Up {
            return false;
        }
        match self.device.stats().await {
            Ok(stats) => stats
                .last_handshake_age_secs
                .is_some_and(|age| age <= handshake_window.as_secs()),
            Err(_) => false,
        }
    }

    /// Forward a relay-carried packet into the tunnel
    pub async fn inject_packet(&self, packet: &[u8]) -> Result<()> {
        if *self.state.read().await != TunnelState::Up {
            return Err(ClientError::Tunnel("tunnel not up".to_string()));
        }
        self.device.inject_packet(packet).await
    }
}
