//! Error types for the gateway server.

use std::net::SocketAddr;

use thiserror::Error;
use twin_gateway::GatewayError;

/// Errors that can occur in the gateway server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// WebSocket error occurred.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Message exceeds the configured size limit.
    #[error("message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Actual message size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The gateway core rejected an operation.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_bind_failed_error_display() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5683);
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = ServerError::BindFailed(addr, io_err);

        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:5683"));
        assert!(msg.contains("address in use"));
    }

    #[test]
    fn test_message_too_large_display() {
        let err = ServerError::MessageTooLarge { size: 10, limit: 4 };
        assert_eq!(
            err.to_string(),
            "message too large: 10 bytes exceeds limit of 4 bytes"
        );
    }

    #[test]
    fn test_gateway_error_is_transparent() {
        let err: ServerError = GatewayError::Unauthorized("no token".to_string()).into();
        assert_eq!(err.to_string(), "unauthorized: no token");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: ServerError = json_err.into();
        assert!(matches!(err, ServerError::Serialization(_)));
    }

    #[test]
    fn test_connection_closed_display() {
        assert_eq!(ServerError::ConnectionClosed.to_string(), "connection closed");
    }
}
