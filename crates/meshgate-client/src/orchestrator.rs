//! Client connection orchestrator.
//!
//! A multi-phase state machine that takes one session from `Disconnected`
//! through `Connecting` to `Connected` and back. The phases inside
//! `Connecting` run in strict order, each with its own failure policy:
//!
//! 1. control-plane health check        - failure aborts
//! 2. local network discovery           - failure aborts
//! 3. route request                     - failure aborts
//! 4. tunnel setup                      - best-effort
//! 5. relay registration of the tunnel  - best-effort
//! 6. relay connect                     - fatal only when no tunnel exists
//! 7. traffic bridging                  - best-effort
//!
//! Partial success (tunnel without relay, or relay without tunnel) is still
//! `Connected`; the missing capability is degraded, not an error. A failed
//! connect always lands back in `Disconnected` with no dangling transport
//! and no pending reconnect timer.
//!
//! State transitions are published on a watch channel and as discrete
//! events; each transition fires exactly once.

use crate::api::{ControlApi, NetworkDiscovery};
use crate::error::{ClientError, Result};
use crate::tunnel::{TunnelDevice, TunnelSession};
use meshgate_control::selector::{Requirements, RouteRequest, SelectedRoute};
use meshgate_relay::transport::{RelayConfig, RelayEvent, RelayTransport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// Phases running
    Connecting,
    /// Session live (possibly degraded to tunnel-only or relay-only)
    Connected,
}

/// Discrete notifications for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The session reached `Connected`
    Connected,
    /// The session was torn down
    Disconnected,
}

/// Client-held session view; derived from the last selected route and
/// transport state, reset to empty on disconnect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatus {
    /// Whether a session is live
    pub connected: bool,
    /// Exit node of the current route
    pub node_id: Option<String>,
    /// Identifier of the selected route
    pub route_id: Option<String>,
    /// Session credential
    pub session_token: Option<String>,
    /// Relay endpoint, present only when the relay channel is up
    pub relay_endpoint: Option<String>,
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Client identifier sent with route requests
    pub client_id: String,
    /// Pin the exit to a specific node
    pub target_node_id: Option<String>,
    /// Route constraints
    pub requirements: Requirements,
    /// Relay transport tuning
    pub relay: RelayConfig,
}

impl OrchestratorConfig {
    /// Config with defaults for the given client id
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            target_node_id: None,
            requirements: Requirements::default(),
            relay: RelayConfig::default(),
        }
    }
}

struct ActiveSession {
    relay: Option<RelayTransport>,
    bridge: Option<JoinHandle<()>>,
}

/// Fold any phase failure into the connection taxonomy without
/// double-wrapping errors that already are one
fn as_connection_error(e: ClientError) -> ClientError {
    match e {
        ClientError::Connection(_) => e,
        other => ClientError::Connection(other.to_string()),
    }
}

/// Client-side connection state machine
pub struct ConnectionOrchestrator {
    api: Arc<dyn ControlApi>,
    discovery: Arc<dyn NetworkDiscovery>,
    tunnel: Arc<TunnelSession>,
    config: OrchestratorConfig,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    status: RwLock<ClientStatus>,
    session: Mutex<Option<ActiveSession>>,
    connecting: AtomicBool,
    cancel: AtomicBool,
}

impl ConnectionOrchestrator {
    /// Create an orchestrator and the event stream its observers consume
    pub fn new(
        api: Arc<dyn ControlApi>,
        discovery: Arc<dyn NetworkDiscovery>,
        device: Arc<dyn TunnelDevice>,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let orchestrator = Self {
            api,
            discovery,
            tunnel: Arc::new(TunnelSession::new(device)),
            config,
            state_tx,
            events,
            status: RwLock::new(ClientStatus::default()),
            session: Mutex::new(None),
            connecting: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        };
        (orchestrator, events_rx)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current session view
    pub async fn status(&self) -> ClientStatus {
        self.status.read().await.clone()
    }

    /// The tunnel session this orchestrator drives
    #[must_use]
    pub fn tunnel(&self) -> &Arc<TunnelSession> {
        &self.tunnel
    }

    /// Establish a session
    ///
    /// Only one `connect` may be in flight per orchestrator; a second call
    /// while `Connecting` is rejected with no side effects.
    pub async fn connect(&self) -> Result<ClientStatus> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnecting);
        }
        if self.state() == ConnectionState::Connected {
            self.connecting.store(false, Ordering::SeqCst);
            return Err(ClientError::AlreadyConnected);
        }
        self.cancel.store(false, Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Connecting);

        let result = self.run_phases().await;
        if let Err(e) = &result {
            debug!(error = %e, "connect failed, cleaning up partial state");
            self.teardown_resources().await;
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
        self.connecting.store(false, Ordering::SeqCst);
        result
    }

    /// Tear the session down
    ///
    /// Idempotent: a no-op when already disconnected. Callable at any
    /// point during `Connecting`; in-flight phases observe the cancel flag
    /// instead of completing naturally. Every teardown step runs even when
    /// an earlier one fails, and closing the relay transport clears any
    /// pending reconnect timer.
    pub async fn disconnect(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let prev = self.state();
        if prev == ConnectionState::Disconnected && !self.connecting.load(Ordering::SeqCst) {
            debug!("disconnect on idle orchestrator, nothing to do");
            return;
        }

        self.teardown_resources().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        if prev == ConnectionState::Connected {
            let _ = self.events.send(ConnectionEvent::Disconnected);
            info!("session disconnected");
        }
    }

    /// Stop bridging, tear down the tunnel, close the relay, reset status
    async fn teardown_resources(&self) {
        let (bridge, relay) = match self.session.lock().await.take() {
            Some(active) => (active.bridge, active.relay),
            None => (None, None),
        };

        if let Some(bridge) = bridge {
            bridge.abort();
        }
        self.tunnel.teardown().await;
        if let Some(relay) = relay {
            relay.disconnect().await;
        }
        *self.status.write().await = ClientStatus::default();
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(ClientError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn run_phases(&self) -> Result<ClientStatus> {
        // Phase 1: health check - nothing to clean up on failure
        let health = self.api.health().await.map_err(as_connection_error)?;
        if !health.is_healthy() {
            return Err(ClientError::Connection(format!(
                "control plane unhealthy: {}",
                health.status
            )));
        }
        self.check_cancel()?;

        // Phase 2: local network discovery
        let client_network = self
            .discovery
            .discover()
            .await
            .map_err(as_connection_error)?;
        self.check_cancel()?;

        // Phase 3: route request
        let request = RouteRequest {
            client_id: self.config.client_id.clone(),
            target_node_id: self.config.target_node_id.clone(),
            requirements: self.config.requirements.clone(),
            client_network,
        };
        let response = self.api.request_route(&request).await?;
        let selected = response.selected_route;
        info!(
            node_id = %selected.node_endpoint.node_id,
            route_id = %selected.candidate.id,
            alternates = response.routes.len(),
            "route selected"
        );
        self.check_cancel()?;

        // Phase 4: tunnel setup - best-effort, the relay can still carry
        // the session
        let mut tunnel_up = false;
        if let Some(tunnel_config) = selected.tunnel_config.clone() {
            match self.tunnel.establish(tunnel_config).await {
                Ok(()) => tunnel_up = true,
                Err(e) => warn!(error = %e, "tunnel setup failed, continuing without direct tunnel"),
            }
        }
        self.check_cancel()?;

        // Phase 5: relay registration of the tunnel endpoint - best-effort
        if tunnel_up {
            if let Some(endpoint) = self.tunnel.local_endpoint().await {
                if let Err(e) = self
                    .api
                    .register_tunnel_endpoint(&selected.node_endpoint.node_id, &endpoint)
                    .await
                {
                    warn!(error = %e, "relay registration failed");
                }
            }
        }
        self.check_cancel()?;

        // Phase 6: relay connect - fatal only when there is no tunnel to
        // fall back on
        let (relay, relay_events) = RelayTransport::new(
            selected.relay_endpoint.clone(),
            selected.session_token.clone(),
            self.config.relay.clone(),
        );
        let mut relay_active = false;
        match relay.connect().await {
            Ok(()) => relay_active = true,
            Err(e) if tunnel_up => {
                warn!(error = %e, "relay connect failed, continuing tunnel-only");
            }
            Err(e) => {
                return Err(ClientError::Connection(format!(
                    "relay connect failed with no tunnel established: {e}"
                )));
            }
        }
        self.check_cancel()?;

        // Phase 7: traffic bridging - best-effort
        let bridge = if relay_active {
            Some(self.spawn_bridge(relay_events))
        } else {
            None
        };

        let status = self
            .finish_connected(&selected, relay_active, relay, bridge)
            .await?;
        Ok(status)
    }

    /// Store the session, flip status to connected, notify observers
    async fn finish_connected(
        &self,
        selected: &SelectedRoute,
        relay_active: bool,
        relay: RelayTransport,
        bridge: Option<JoinHandle<()>>,
    ) -> Result<ClientStatus> {
        *self.session.lock().await = Some(ActiveSession {
            relay: relay_active.then_some(relay),
            bridge,
        });

        let status = ClientStatus {
            connected: true,
            node_id: Some(selected.node_endpoint.node_id.clone()),
            route_id: Some(selected.candidate.id.clone()),
            session_token: Some(selected.session_token.clone()),
            relay_endpoint: relay_active.then(|| selected.relay_endpoint.clone()),
        };
        *self.status.write().await = status.clone();

        self.state_tx.send_replace(ConnectionState::Connected);
        let _ = self.events.send(ConnectionEvent::Connected);
        info!(relay = relay_active, "session connected");
        Ok(status)
    }

    /// Pump relay events, feeding fallback packets into the tunnel
    fn spawn_bridge(
        &self,
        mut relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> JoinHandle<()> {
        let tunnel = Arc::clone(&self.tunnel);
        tokio::spawn(async move {
            while let Some(event) = relay_events.recv().await {
                match event {
                    RelayEvent::Packet(bytes) => {
                        if let Err(e) = tunnel.inject_packet(&bytes).await {
                            debug!(error = %e, "relay packet not bridged");
                        }
                    }
                    RelayEvent::PeerError(message) => {
                        warn!(error = %message, "relay peer reported an error");
                    }
                    RelayEvent::AuthExpired => {
                        warn!("relay credential expired, fallback path gone");
                    }
                    RelayEvent::Closed => break,
                    _ => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HealthReply;
    use crate::tunnel::tests::FakeDevice;
    use async_trait::async_trait;
    use meshgate_control::node::NatType;
    use meshgate_control::selector::{
        ClientNetworkInfo, NodeEndpoint, RouteCandidate, RouteKind, RouteResponse, TunnelConfig,
    };
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct FakeApi {
        healthy: AtomicBool,
        route_fails: AtomicBool,
        with_tunnel: bool,
        health_delay: Duration,
    }

    impl FakeApi {
        fn new(with_tunnel: bool) -> Self {
            Self {
                healthy: AtomicBool::new(true),
                route_fails: AtomicBool::new(false),
                with_tunnel,
                health_delay: Duration::ZERO,
            }
        }

        fn route_response(&self) -> RouteResponse {
            let candidate = RouteCandidate {
                id: "rt-client-1-n1".to_string(),
                kind: if self.with_tunnel {
                    RouteKind::Direct
                } else {
                    RouteKind::Relayed
                },
                path: vec!["n1".to_string()],
                estimated_latency_ms: 40.0,
                estimated_bandwidth_mbps: 100.0,
                cost: 28.0,
                priority: 145,
            };
            RouteResponse {
                routes: Vec::new(),
                selected_route: SelectedRoute {
                    candidate,
                    // Nothing listens here: relay connect fails fast
                    relay_endpoint: "ws://127.0.0.1:9/relay".to_string(),
                    node_endpoint: NodeEndpoint {
                        node_id: "n1".to_string(),
                        direct_connection: self.with_tunnel,
                    },
                    session_token: "9999999999:nonce:c2ln".to_string(),
                    expires_at: 9_999_999_999,
                    tunnel_config: self.with_tunnel.then(|| TunnelConfig {
                        server_public_key: "srv-pk".to_string(),
                        server_endpoint: "203.0.113.10".to_string(),
                        server_port: Some(51820),
                        allowed_ips: "0.0.0.0/0".to_string(),
                    }),
                },
            }
        }
    }

    #[async_trait]
    impl ControlApi for FakeApi {
        async fn health(&self) -> Result<HealthReply> {
            if !self.health_delay.is_zero() {
                tokio::time::sleep(self.health_delay).await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(HealthReply {
                    status: "healthy".to_string(),
                })
            } else {
                Err(ClientError::Connection("health check refused".to_string()))
            }
        }

        async fn request_route(&self, _request: &RouteRequest) -> Result<RouteResponse> {
            if self.route_fails.load(Ordering::SeqCst) {
                return Err(ClientError::Route("no viable route".to_string()));
            }
            Ok(self.route_response())
        }

        async fn register_tunnel_endpoint(&self, _node_id: &str, _endpoint: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FakeDiscovery;

    #[async_trait]
    impl NetworkDiscovery for FakeDiscovery {
        async fn discover(&self) -> Result<ClientNetworkInfo> {
            Ok(ClientNetworkInfo {
                ipv4: "198.51.100.7".to_string(),
                nat_type: NatType::FullCone,
                stun_mapped_address: None,
            })
        }
    }

    fn orchestrator_with(
        api: Arc<FakeApi>,
        device: Arc<FakeDevice>,
    ) -> (ConnectionOrchestrator, mpsc::UnboundedReceiver<ConnectionEvent>) {
        ConnectionOrchestrator::new(
            api,
            Arc::new(FakeDiscovery),
            device,
            OrchestratorConfig::new("client-1"),
        )
    }

    #[tokio::test]
    async fn test_health_failure_aborts() {
        let api = Arc::new(FakeApi::new(true));
        api.healthy.store(false, Ordering::SeqCst);
        let (orchestrator, mut events) = orchestrator_with(api, Arc::new(FakeDevice::new()));

        let err = orchestrator.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
        assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_failure_aborts_with_route_error() {
        let api = Arc::new(FakeApi::new(true));
        api.route_fails.store(true, Ordering::SeqCst);
        let (orchestrator, _events) = orchestrator_with(api, Arc::new(FakeDevice::new()));

        let err = orchestrator.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Route(_)));
        assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_tunnel_only_session_survives_relay_failure() {
        // Relay endpoint unreachable, tunnel healthy: session degrades to
        // tunnel-only instead of failing
        let (orchestrator, mut events) =
            orchestrator_with(Arc::new(FakeApi::new(true)), Arc::new(FakeDevice::new()));

        let status = orchestrator.connect().await.unwrap();
        assert!(status.connected);
        assert_eq!(status.node_id.as_deref(), Some("n1"));
        assert!(status.relay_endpoint.is_none());
        assert_eq!(orchestrator.state(), ConnectionState::Connected);
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Connected);
    }

    #[tokio::test]
    async fn test_no_tunnel_and_relay_failure_is_fatal() {
        // Route has no tunnel config and the relay is unreachable
        let (orchestrator, mut events) =
            orchestrator_with(Arc::new(FakeApi::new(false)), Arc::new(FakeDevice::new()));

        let err = orchestrator.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
        assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
        assert_eq!(orchestrator.status().await, ClientStatus::default());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tunnel_device_failure_falls_through_to_fatal_relay() {
        // Tunnel config present but the device refuses, relay unreachable:
        // nothing can carry the session
        let device = Arc::new(FakeDevice::new());
        device.fail_configure.store(true, Ordering::SeqCst);
        let (orchestrator, _events) = orchestrator_with(Arc::new(FakeApi::new(true)), device);

        let err = orchestrator.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
        assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_second_connect_rejected_while_connecting() {
        let mut api = FakeApi::new(true);
        api.health_delay = Duration::from_millis(200);
        let api = Arc::new(api);
        let (orchestrator, _events) = orchestrator_with(api, Arc::new(FakeDevice::new()));
        let orchestrator = Arc::new(orchestrator);

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Second call while the first is still in its health phase
        let err = orchestrator.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyConnecting));

        // First proceeds unaffected
        let status = first.await.unwrap().unwrap();
        assert!(status.connected);
    }

    #[tokio::test]
    async fn test_connect_when_connected_rejected() {
        let (orchestrator, _events) =
            orchestrator_with(Arc::new(FakeApi::new(true)), Arc::new(FakeDevice::new()));

        orchestrator.connect().await.unwrap();
        let err = orchestrator.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyConnected));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let device = Arc::new(FakeDevice::new());
        let (orchestrator, mut events) =
            orchestrator_with(Arc::new(FakeApi::new(true)), device.clone());

        orchestrator.connect().await.unwrap();
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Connected);

        orchestrator.disconnect().await;
        orchestrator.disconnect().await;

        assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
        assert_eq!(orchestrator.status().await, ClientStatus::default());
        // Exactly one disconnect notification for two calls
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Disconnected);
        assert!(events.try_recv().is_err());
        // Tunnel device saw exactly one down
        assert_eq!(device.downs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_cycle_after_disconnect() {
        let (orchestrator, mut events) =
            orchestrator_with(Arc::new(FakeApi::new(true)), Arc::new(FakeDevice::new()));

        orchestrator.connect().await.unwrap();
        orchestrator.disconnect().await;
        let status = orchestrator.connect().await.unwrap();

        assert!(status.connected);
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Connected);
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Disconnected);
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_during_connecting_cancels() {
        let mut api = FakeApi::new(true);
        api.health_delay = Duration::from_millis(200);
        let api = Arc::new(api);
        let (orchestrator, mut events) = orchestrator_with(api, Arc::new(FakeDevice::new()));
        let orchestrator = Arc::new(orchestrator);

        let connect = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        orchestrator.disconnect().await;

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        assert_eq!(orchestrator.state(), ConnectionState::Disconnected);
        // Never connected, so no notification fired
        assert!(events.try_recv().is_err());
    }
}
