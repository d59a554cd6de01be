//! Error types for the twin-proto crate.

use thiserror::Error;

/// Errors that can occur while building or decoding protocol values.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a payload.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a payload.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Content format the gateway does not understand.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decoding(err.to_string())
    }
}
