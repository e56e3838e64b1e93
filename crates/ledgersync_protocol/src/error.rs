//! Error types for protocol encoding and parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or parsing protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A textual enum value was not recognized.
    #[error("unknown {kind} '{value}'")]
    UnknownVariant {
        /// Name of the enum being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
}
