//! Server configuration.

use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on records per pull page.
    pub max_pull_page: u32,
    /// Whether requests must carry a valid bearer token.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
    /// Fields every create/update payload must carry, per table.
    pub required_fields: BTreeMap<String, Vec<String>>,
}

impl ServerConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            max_pull_page: 100,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
            required_fields: BTreeMap::new(),
        }
    }

    /// Sets the maximum pull page size.
    pub fn with_max_pull_page(mut self, size: u32) -> Self {
        self.max_pull_page = size;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Requires `fields` in every create/update payload of `table`.
    pub fn with_required_fields<I, S>(mut self, table: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields
            .insert(table.into(), fields.into_iter().map(Into::into).collect());
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_pull_page, 100);
        assert!(!config.require_auth);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_pull_page(50)
            .with_auth(vec![1, 2, 3, 4])
            .with_required_fields("contacts", ["name", "email"]);

        assert_eq!(config.max_pull_page, 50);
        assert!(config.require_auth);
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3, 4]));
        assert_eq!(config.required_fields["contacts"], vec!["name", "email"]);
    }
}
