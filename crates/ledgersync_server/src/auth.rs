//! Authentication support for the sync server.
//!
//! Tokens are HMAC-SHA256 signed and carried as bearer strings.
//!
//! ## Token Format
//!
//! `<client_id>.<issued_at_millis>.<hex signature>`, where the signature
//! covers `<client_id>.<issued_at_millis>`.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use ledgersync_protocol::Timestamp;
use sha2::Sha256;
use std::fmt::Write as _;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and checks bearer tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `client_id`, valid from now.
    pub fn create_token(&self, client_id: &str) -> String {
        self.create_token_at(client_id, Timestamp::now())
    }

    fn create_token_at(&self, client_id: &str, issued_at: Timestamp) -> String {
        let claims = format!("{client_id}.{}", issued_at.as_millis());
        let signature = to_hex(&self.sign(claims.as_bytes()));
        format!("{claims}.{signature}")
    }

    /// Validates a token and returns the client it was issued to.
    pub fn validate_token(&self, token: &str) -> ServerResult<String> {
        let (claims, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| ServerError::NotAuthorized("malformed token".into()))?;
        let (client_id, issued) = claims
            .rsplit_once('.')
            .ok_or_else(|| ServerError::NotAuthorized("malformed token".into()))?;
        if client_id.is_empty() {
            return Err(ServerError::NotAuthorized("missing client id".into()));
        }

        let expected = to_hex(&self.sign(claims.as_bytes()));
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(ServerError::NotAuthorized("invalid signature".into()));
        }

        let issued_at = issued
            .parse::<u64>()
            .map(Timestamp::from_millis)
            .map_err(|_| ServerError::NotAuthorized("malformed issue time".into()))?;
        if Timestamp::now() > issued_at.saturating_add(self.config.token_expiry) {
            return Err(ServerError::NotAuthorized("token expired".into()));
        }

        Ok(client_id.to_string())
    }

    fn sign(&self, data: &[u8]) -> [u8; 32] {
        // HMAC accepts keys of any length, so this never fails.
        let mut mac = match HmacSha256::new_from_slice(&self.config.secret) {
            Ok(mac) => mac,
            Err(_) => return [0; 32],
        };
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
