//! Short-lived NAT-relay credentials.
//!
//! Follows the ephemeral-credential convention of TURN REST: the username is
//! `<expiry-unix>:<nonce>` and the password is the base64 HMAC-SHA1 of the
//! username under a secret shared with the relay server. The relay validates
//! by recomputing the HMAC - no round trip to the control plane. Expiry is
//! purely time-based; there is no server-side revocation, so issuer and
//! relay clocks must stay in sync.

use crate::error::{ControlError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

const NONCE_LEN: usize = 12;

/// A time-windowed relay credential
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RelayCredential {
    /// `<expiry-unix>:<nonce>`
    pub username: String,
    /// base64 HMAC-SHA1 over the username
    pub password: String,
    /// Validity in seconds from issuance
    pub ttl: u64,
}

/// Issues HMAC-signed relay credentials
pub struct CredentialIssuer {
    secret: String,
    realm: String,
}

impl CredentialIssuer {
    /// Create an issuer for the given realm and shared secret
    #[must_use]
    pub fn new(realm: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            realm: realm.into(),
        }
    }

    /// Realm this issuer signs for
    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Mint a credential valid for `ttl_seconds` from now
    pub fn issue(&self, ttl_seconds: u64) -> Result<RelayCredential> {
        let expiry = Self::unix_now().saturating_add(ttl_seconds);
        let nonce: String = rand::thread_rng()
            .sample_iter(rand::distributions::Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        let username = format!("{expiry}:{nonce}");
        let password = self.sign(&username)?;

        Ok(RelayCredential {
            username,
            password,
            ttl: ttl_seconds,
        })
    }

    /// Recompute the HMAC over `username`, as the relay server does
    pub fn sign(&self, username: &str) -> Result<String> {
        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ControlError::Credential(e.to_string()))?;
        mac.update(username.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Validate a presented username/password pair
    pub fn verify(&self, username: &str, password: &str) -> Result<bool> {
        Ok(self.sign(username)? == password)
    }

    /// Whether the credential's embedded expiry has passed at `now`
    ///
    /// A username that does not carry a parseable expiry is treated as
    /// expired rather than accepted open-ended.
    #[must_use]
    pub fn is_expired(username: &str, now: u64) -> bool {
        username
            .split(':')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .is_none_or(|expiry| expiry <= now)
    }

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
