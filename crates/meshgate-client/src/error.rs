//! Error types for the client session machinery.

use thiserror::Error;

/// Client-side errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Health/network reachability failure; nothing was set up
    #[error("connection error: {0}")]
    Connection(String),

    /// Route request failed or the selector found no viable route
    #[error("route error: {0}")]
    Route(String),

    /// Tunnel device failure
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Control-plane API failure outside the route path
    #[error("api error: {0}")]
    Api(String),

    /// A connect is already in flight on this orchestrator
    #[error("connect already in progress")]
    AlreadyConnecting,

    /// The orchestrator is already connected
    #[error("already connected")]
    AlreadyConnected,

    /// The connect attempt was cancelled by a concurrent disconnect
    #[error("connect cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether the error reports caller misuse rather than a network fault
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ClientError::AlreadyConnecting | ClientError::AlreadyConnected
        )
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_error_classification() {
        assert!(ClientError::AlreadyConnecting.is_caller_error());
        assert!(ClientError::AlreadyConnected.is_caller_error());
        assert!(!ClientError::Connection("down".to_string()).is_caller_error());
        assert!(!ClientError::Cancelled.is_caller_error());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::Route("no viable route".to_string());
        assert_eq!(err.to_string(), "route error: no viable route");
    }
}
