//! Request handlers for sync endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::tables::RemoteTables;
use ledgersync_protocol::{
    PullPage, PullRequest, PushRequest, PushResponse, VersionRequest, VersionResponse,
};
use std::sync::Arc;
use tracing::debug;

/// Handler for sync requests.
#[derive(Debug)]
pub struct RequestHandler {
    config: ServerConfig,
    tables: Arc<RemoteTables>,
    validator: Option<TokenValidator>,
}

impl RequestHandler {
    /// Creates a handler over `tables`.
    pub fn new(config: ServerConfig, tables: Arc<RemoteTables>) -> Self {
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => Some(TokenValidator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )),
            _ => None,
        };
        Self {
            config,
            tables,
            validator,
        }
    }

    /// Returns the token validator, if authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Checks the bearer token of a request.
    ///
    /// Returns the authenticated client, or `None` when auth is disabled.
    pub fn authorize(&self, bearer: Option<&str>) -> ServerResult<Option<String>> {
        if !self.config.require_auth {
            return Ok(None);
        }
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| ServerError::Internal("auth required but no secret configured".into()))?;
        let token = bearer.ok_or_else(|| ServerError::NotAuthorized("missing token".into()))?;
        validator.validate_token(token).map(Some)
    }

    /// Handles a push request.
    ///
    /// A checked write whose base version differs from the current version
    /// is not applied; the response carries the current copy instead.
    pub fn handle_push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        self.validate_push(request)?;

        let current = self.tables.get(&request.table_name, &request.record_id);
        if let Some(current) = current.filter(|c| request.conflicts_with(c)) {
            debug!(
                table = %request.table_name,
                record_id = %request.record_id,
                current = current.remote_version,
                base = ?request.base_version,
                "Push conflict"
            );
            return Ok(PushResponse::conflict(current));
        }

        let payload = if request.operation.carries_payload() {
            request.payload.clone()
        } else {
            None
        };
        let stored = self
            .tables
            .write(&request.table_name, &request.record_id, payload);
        debug!(
            table = %request.table_name,
            record_id = %request.record_id,
            operation = %request.operation,
            version = stored.remote_version,
            "Push applied"
        );
        Ok(PushResponse::accepted(
            stored.remote_version,
            stored.remote_updated_at,
        ))
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: &PullRequest) -> ServerResult<PullPage> {
        if request.table_name.is_empty() {
            return Err(ServerError::InvalidRequest("missing table name".into()));
        }
        let limit = request.limit.clamp(1, self.config.max_pull_page.max(1));
        Ok(self.tables.changes(
            &request.table_name,
            request.since,
            request.after.as_ref(),
            limit as usize,
        ))
    }

    /// Handles a version lookup.
    pub fn handle_version(&self, request: &VersionRequest) -> ServerResult<VersionResponse> {
        Ok(VersionResponse {
            record: self.tables.get(&request.table_name, &request.record_id),
        })
    }

    fn validate_push(&self, request: &PushRequest) -> ServerResult<()> {
        if request.table_name.is_empty() || request.record_id.is_empty() {
            return Err(ServerError::InvalidRequest(
                "table name and record id are required".into(),
            ));
        }
        if !request.operation.carries_payload() {
            return Ok(());
        }

        let fields = request
            .payload
            .as_ref()
            .and_then(|p| p.as_object())
            .ok_or_else(|| {
                ServerError::Validation(format!(
                    "{} payload for {}/{} must be an object",
                    request.operation, request.table_name, request.record_id
                ))
            })?;
        if let Some(required) = self.config.required_fields.get(&request.table_name) {
            let missing: Vec<&str> = required
                .iter()
                .filter(|f| fields.get(f.as_str()).map_or(true, |v| v.is_null()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(ServerError::Validation(format!(
                    "{}/{} is missing required fields: {}",
                    request.table_name,
                    request.record_id,
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }
}
