//! Control-plane API contract.
//!
//! The orchestrator talks to the control plane through [`ControlApi`]; the
//! HTTP implementation here is the production path, tests substitute their
//! own. Route request/response bodies are the shared wire DTOs from
//! `meshgate-control`.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use meshgate_control::selector::{ClientNetworkInfo, RouteRequest, RouteResponse};
use serde::{Deserialize, Serialize};

/// `GET /health` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReply {
    /// Reported status; anything but `"healthy"` reads as unhealthy
    pub status: String,
}

impl HealthReply {
    /// Whether the control plane reported itself healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Error body carried on non-2xx responses
#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
}

/// Client-side view of the control plane
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// `GET /health`
    async fn health(&self) -> Result<HealthReply>;

    /// `POST /api/v1/routes` - request a route into the overlay
    async fn request_route(&self, request: &RouteRequest) -> Result<RouteResponse>;

    /// Announce the tunnel's local endpoint for relay coordination
    async fn register_tunnel_endpoint(&self, node_id: &str, endpoint: &str) -> Result<()>;
}

/// Local network facts collaborator (STUN probing, interface enumeration)
///
/// OS specifics stay outside the core; the orchestrator only consumes the
/// resulting [`ClientNetworkInfo`].
#[async_trait]
pub trait NetworkDiscovery: Send + Sync {
    /// Discover the client's reachability facts
    async fn discover(&self) -> Result<ClientNetworkInfo>;
}

/// HTTP implementation of [`ControlApi`]
pub struct HttpControlApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpControlApi {
    /// Create a client for the control plane at `base_url`
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Surface a non-2xx response with its status code and error body
    async fn error_from(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let detail = match response.json::<ErrorReply>().await {
            Ok(body) => body.error,
            Err(_) => "no error detail".to_string(),
        };
        ClientError::Api(format!("status {status}: {detail}"))
    }
}

#[async_trait]
impl ControlApi for HttpControlApi {
    async fn health(&self) -> Result<HealthReply> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))
    }

    async fn request_route(&self, request: &RouteRequest) -> Result<RouteResponse> {
        let response = self
            .http
            .post(format!("{}/api/v1/routes", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Route(e.to_string()))?;

        if !response.status().is_success() {
            let err = Self::error_from(response).await;
            return Err(ClientError::Route(err.to_string()));
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::Route(e.to_string()))
    }

    async fn register_tunnel_endpoint(&self, node_id: &str, endpoint: &str) -> Result<()> {
        let body = serde_json::json!({ "endpoint": endpoint });
        let response = self
            .http
            .post(format!(
                "{}/api/v1/nodes/{node_id}/relay-endpoint",
                self.base_url
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_reply_classification() {
        assert!(HealthReply {
            status: "healthy".to_string()
        }
        .is_healthy());
        assert!(!HealthReply {
            status: "degraded".to_string()
        }
        .is_healthy());
        assert!(!HealthReply {
            status: "HEALTHY".to_string()
        }
        .is_healthy());
    }

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let api = HttpControlApi::new("https://control.test///");
        assert_eq!(api.base_url, "https://control.test");
    }

    #[test]
    fn test_health_reply_wire_shape() {
        let reply: HealthReply = serde_json::from_str(r#"{"status":"healthy"}"#).unwrap();
        assert!(reply.is_healthy());
    }
}
