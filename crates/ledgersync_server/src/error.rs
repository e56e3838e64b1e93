//! Error types for the sync server.

use ledgersync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request body or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The payload does not satisfy the table's rules.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing, malformed or expired credentials.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No handler for the requested path.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// The server is refusing requests.
    #[error("service unavailable")]
    Unavailable,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encode(msg) => ServerError::Internal(msg),
            other => ServerError::InvalidRequest(other.to_string()),
        }
    }
}

impl ServerError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::NotAuthorized(_) => 401,
            ServerError::UnknownEndpoint(_) => 404,
            ServerError::Validation(_) => 422,
            ServerError::Internal(_) => 500,
            ServerError::Unavailable => 503,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(ServerError::Unavailable.is_server_error());
        assert!(!ServerError::Validation("bad".into()).is_server_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::NotAuthorized("expired".into()).status_code(), 401);
        assert_eq!(ServerError::Validation("missing name".into()).status_code(), 422);
        assert_eq!(ServerError::UnknownEndpoint("/x".into()).status_code(), 404);
    }

    #[test]
    fn decode_failures_are_client_errors() {
        let err: ServerError = ProtocolError::Decode("truncated".into()).into();
        assert_eq!(err.status_code(), 400);
    }
}
