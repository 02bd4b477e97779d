//! Relay transport over a persistent WebSocket.
//!
//! One long-lived socket carries both raw tunnel packets and JSON control
//! messages (see [`crate::protocol`]). The transport owns the connection
//! lifecycle:
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Closed
//!                        ^                   |
//!                        |   (non-terminal)  v
//!                        +---- Reconnecting -+
//! ```
//!
//! `Closed` is terminal only after a caller-initiated [`RelayTransport::disconnect`].
//! Any other close schedules exactly one reconnect attempt after a fixed
//! delay; a second close while an attempt is pending does not schedule
//! another. Reconnection reuses the original credential and fails fast once
//! it has expired instead of retrying indefinitely.
//!
//! Delivery order within one connection follows send order; nothing is
//! guaranteed across reconnects.

use crate::protocol::{ControlEnvelope, RelayFrame, classify};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, warn};

/// Transport errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// The session credential's embedded expiry has passed
    #[error("relay credential expired")]
    AuthExpired,

    /// A connection attempt is already active
    #[error("transport already active")]
    AlreadyActive,

    /// The transport was explicitly disconnected
    #[error("transport closed")]
    Closed,

    /// Socket-level failure
    #[error("relay i/o error: {0}")]
    Io(String),

    /// Malformed endpoint or handshake
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

/// Transport lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Created, never connected
    Idle,
    /// Dial in progress
    Connecting,
    /// Channel established, frames flowing
    Open,
    /// Caller-initiated close in progress
    Closing,
    /// Waiting out the backoff before the next dial
    Reconnecting,
    /// No connection; terminal once `disconnect` was called
    Closed,
}

/// Events surfaced to the transport's owner
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Channel reached `Open`
    Open,
    /// Raw tunnel packet received
    Packet(Bytes),
    /// Control envelope received (liveness and packet envelopes are handled
    /// internally and do not appear here)
    Control(ControlEnvelope),
    /// Server-reported fault; the connection stays up
    PeerError(String),
    /// Non-terminal close observed, one reconnect attempt scheduled
    Reconnecting,
    /// Reconnect abandoned because the credential expired
    AuthExpired,
    /// Channel fully closed
    Closed,
}

/// Transport tuning knobs
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interval between outgoing `ping` control messages while `Open`
    pub heartbeat_interval: Duration,
    /// Inbound silence beyond this reads as unhealthy via [`RelayTransport::is_alive`]
    pub read_timeout: Duration,
    /// Fixed delay before the single scheduled reconnect attempt
    pub reconnect_delay: Duration,
    /// Send packets as binary frames; when false they are wrapped as
    /// base64 `packet` envelopes
    pub binary_frames: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            read_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            binary_frames: true,
        }
    }
}

/// Parse the expiry out of a `<expiry>:<nonce>:<hmac>` session token
#[must_use]
pub fn token_expiry(token: &str) -> Option<u64> {
    token.split(':').next().and_then(|s| s.parse().ok())
}

/// Whether the token's embedded expiry has passed at `now`
///
/// A token with no parseable expiry is treated as expired.
#[must_use]
pub fn token_is_expired(token: &str, now: u64) -> bool {
    token_expiry(token).is_none_or(|expiry| expiry <= now)
}

/// What an inbound payload asks of the transport
#[derive(Debug, PartialEq)]
pub(crate) struct Dispatch {
    /// Event to surface to the owner
    pub event: Option<RelayEvent>,
    /// Immediate control reply to send back
    pub reply: Option<ControlEnvelope>,
}

/// Classify an inbound payload and decide how to react
pub(crate) fn dispatch(payload: &[u8]) -> Dispatch {
    match classify(payload) {
        RelayFrame::Packet(bytes) => Dispatch {
            event: Some(RelayEvent::Packet(bytes)),
            reply: None,
        },
        RelayFrame::Control(envelope) => match envelope {
            ControlEnvelope::Ping => Dispatch {
                event: None,
                reply: Some(ControlEnvelope::Pong),
            },
            ControlEnvelope::Pong => Dispatch {
                event: None,
                reply: None,
            },
            ControlEnvelope::Error { data } => Dispatch {
                event: Some(RelayEvent::PeerError(data)),
                reply: None,
            },
            packet @ ControlEnvelope::Packet { .. } => match packet.decode_packet() {
                Ok(bytes) => Dispatch {
                    event: Some(RelayEvent::Packet(bytes)),
                    reply: None,
                },
                Err(e) => {
                    warn!(error = %e, "undecodable packet envelope");
                    Dispatch {
                        event: None,
                        reply: None,
                    }
                }
            },
            other => Dispatch {
                event: Some(RelayEvent::Control(other)),
                reply: None,
            },
        },
    }
}

struct Inner {
    endpoint: String,
    token: String,
    config: RelayConfig,
    state_tx: watch::Sender<RelayState>,
    events: mpsc::UnboundedSender<RelayEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    last_activity: Mutex<Instant>,
    reconnect_pending: AtomicBool,
    shutdown: AtomicBool,
}

/// Framed bidirectional channel over a single relay WebSocket
///
/// Cheap to clone; all clones share one connection. The socket is owned
/// exclusively by this transport and never shared across sessions.
#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<Inner>,
}

impl RelayTransport {
    /// Create a transport for `endpoint`, authorized by `token`
    ///
    /// Returns the transport and the event stream its owner consumes.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        config: RelayConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(RelayState::Idle);
        let transport = Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.into(),
                token: token.into(),
                config,
                state_tx,
                events,
                outbound: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                reconnect_pending: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        };
        (transport, events_rx)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> RelayState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether inbound traffic was seen within `window`
    ///
    /// This is the liveness signal: heartbeats do not enforce strict
    /// ping/pong pairing, silence beyond the read timeout is what marks the
    /// channel unhealthy.
    pub async fn is_alive(&self, window: Duration) -> bool {
        self.state() == RelayState::Open
            && self.inner.last_activity.lock().await.elapsed() < window
    }

    /// Establish the relay channel
    ///
    /// Fails fast with [`RelayError::AuthExpired`] when the session token
    /// already expired; a dial failure leaves the transport `Closed` with
    /// no reconnect scheduled (initial connect does not retry).
    pub async fn connect(&self) -> Result<(), RelayError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        match self.state() {
            RelayState::Idle | RelayState::Closed => {}
            _ => return Err(RelayError::AlreadyActive),
        }

        if token_is_expired(&self.inner.token, unix_now()) {
            return Err(RelayError::AuthExpired);
        }

        self.set_state(RelayState::Connecting);
        match self.dial().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(RelayState::Closed);
                Err(e)
            }
        }
    }

    /// Send a control message
    ///
    /// A no-op with a logged warning when the channel is not `Open`; never
    /// errors, so callers mid-teardown stay stable.
    pub async fn send_control(&self, envelope: ControlEnvelope) {
        if self.state() != RelayState::Open {
            warn!(state = ?self.state(), "send_control on non-open channel dropped");
            return;
        }
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "control envelope failed to encode");
                return;
            }
        };
        self.send_raw(Message::Text(json.into())).await;
    }

    /// Send a tunnel packet
    ///
    /// Uses a binary frame when configured, otherwise wraps the bytes as a
    /// base64 `packet` envelope. No-op with a warning when not `Open`.
    pub async fn send_packet(&self, bytes: &[u8]) {
        if self.state() != RelayState::Open {
            warn!(state = ?self.state(), "send_packet on non-open channel dropped");
            return;
        }
        if self.inner.config.binary_frames {
            self.send_raw(Message::Binary(bytes.to_vec().into())).await;
        } else {
            let envelope = ControlEnvelope::packet(bytes, None);
            self.send_control(envelope).await;
        }
    }

    /// Close the channel for good
    ///
    /// Idempotent: a second call is a no-op. Clears any pending reconnect
    /// so a timer cannot race the channel back to life after teardown.
    pub async fn disconnect(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(RelayState::Closing);

        if let Some(tx) = self.inner.outbound.lock().await.take() {
            let _ = tx.send(Message::Close(None));
        }

        self.set_state(RelayState::Closed);
        let _ = self.inner.events.send(RelayEvent::Closed);
        debug!("relay transport disconnected");
    }

    fn set_state(&self, state: RelayState) {
        self.inner.state_tx.send_replace(state);
    }

    async fn send_raw(&self, message: Message) {
        let guard = self.inner.outbound.lock().await;
        if let Some(tx) = guard.as_ref() {
            if tx.send(message).is_err() {
                warn!("relay writer gone, frame dropped");
            }
        } else {
            warn!("no active relay socket, frame dropped");
        }
    }

    /// Dial the endpoint and wire up the reader/writer/heartbeat tasks
    async fn dial(&self) -> Result<(), RelayError> {
        let mut request = self
            .inner
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Protocol(e.to_string()))?;
        let bearer = format!("Bearer {}", self.inner.token)
            .parse()
            .map_err(|_| RelayError::Protocol("token not header-safe".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| RelayError::Io(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.inner.outbound.lock().await = Some(out_tx);
        *self.inner.last_activity.lock().await = Instant::now();

        self.set_state(RelayState::Open);
        let _ = self.inner.events.send(RelayEvent::Open);
        debug!(endpoint = %self.inner.endpoint, "relay channel open");

        // Writer: drains the outbound queue, preserving send order
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "relay write failed");
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        // Heartbeat: pings on a fixed interval while the channel is open
        let heartbeat = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat.inner.config.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat.state() != RelayState::Open {
                    break;
                }
                heartbeat.send_control(ControlEnvelope::Ping).await;
            }
        });

        // Reader: classifies frames and reacts until the stream ends
        let reader = self.clone();
        tokio::spawn(async move {
            while let Some(result) = source.next().await {
                match result {
                    Ok(Message::Binary(payload)) => reader.process_incoming(&payload).await,
                    Ok(Message::Text(payload)) => {
                        reader.process_incoming(payload.as_bytes()).await;
                    }
                    Ok(Message::Ping(payload)) => {
                        *reader.inner.last_activity.lock().await = Instant::now();
                        reader.send_raw(Message::Pong(payload)).await;
                    }
                    Ok(Message::Pong(_)) => {
                        *reader.inner.last_activity.lock().await = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        warn!(error = %e, "relay read failed");
                        break;
                    }
                }
            }
            reader.handle_close().await;
        });

        Ok(())
    }

    async fn process_incoming(&self, payload: &[u8]) {
        *self.inner.last_activity.lock().await = Instant::now();
        let Dispatch { event, reply } = dispatch(payload);
        if let Some(reply) = reply {
            self.send_control(reply).await;
        }
        if let Some(event) = event {
            let _ = self.inner.events.send(event);
        }
    }

    /// React to the socket going away underneath us
    async fn handle_close(&self) {
        self.inner.outbound.lock().await.take();

        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        self.schedule_reconnect();
    }

    /// Schedule exactly one reconnect attempt
    ///
    /// The pending flag makes scheduling idempotent: two close events in
    /// quick succession produce a single attempt.
    fn schedule_reconnect(&self) {
        if self.inner.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("reconnect already pending, not scheduling another");
            return;
        }

        self.set_state(RelayState::Reconnecting);
        let _ = self.inner.events.send(RelayEvent::Reconnecting);

        let transport = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(transport.inner.config.reconnect_delay).await;
            transport
                .inner
                .reconnect_pending
                .store(false, Ordering::SeqCst);

            if transport.inner.shutdown.load(Ordering::SeqCst) {
                return;
            }

            // The credential is reused as-is; once it has expired there is
            // no point dialing again
            if token_is_expired(&transport.inner.token, unix_now()) {
                warn!("relay credential expired, abandoning reconnect");
                transport.set_state(RelayState::Closed);
                let _ = transport.inner.events.send(RelayEvent::AuthExpired);
                let _ = transport.inner.events.send(RelayEvent::Closed);
                return;
            }

            transport.set_state(RelayState::Connecting);
            if let Err(e) = transport.dial().await {
                warn!(error = %e, "reconnect attempt failed");
                transport.schedule_reconnect();
            }
        });
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
