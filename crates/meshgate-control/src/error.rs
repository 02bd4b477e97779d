//! Error types for the control plane.

use thiserror::Error;

/// Control-plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Node is not present in the registry
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// No candidate satisfied the mandatory route constraints
    #[error("no viable route: {0}")]
    NoViableRoute(String),

    /// Durable store failure; never silently retried by the registry
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Credential issuance failed
    #[error("credential error: {0}")]
    Credential(String),
}

impl ControlError {
    /// Returns true if the caller may retry against a fresh snapshot
    ///
    /// `StoreUnavailable` is transient from the caller's perspective even
    /// though the registry itself never retries it.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlError::StoreUnavailable(_))
    }
}

/// Result type for control-plane operations
pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControlError::UnknownNode("node-7".to_string());
        assert_eq!(err.to_string(), "unknown node: node-7");

        let err = ControlError::NoViableRoute("no online candidates".to_string());
        assert!(err.to_string().contains("no viable route"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ControlError::StoreUnavailable("down".to_string()).is_transient());
        assert!(!ControlError::UnknownNode("n".to_string()).is_transient());
        assert!(!ControlError::Credential("hmac".to_string()).is_transient());
    }
}
