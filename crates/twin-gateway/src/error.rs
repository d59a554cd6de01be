//! Error types for the gateway core.

use thiserror::Error;
use twin_proto::{Code, ProtoError, RpcCode};

/// Errors raised by sessions, handlers and backend collaborators.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No valid authorization context.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated but not allowed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller lacks permission for the target.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed request or payload.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend or device unreachable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Operation did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The observation container indexes diverged.
    #[error("unstable observation container: {0}")]
    UnstableContainer(String),

    /// Backend call failed with an RPC code.
    #[error("backend error ({code}): {message}")]
    Backend {
        /// RPC code returned by the backend.
        code: RpcCode,
        /// Backend message.
        message: String,
    },

    /// Device connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Build a backend error.
    #[must_use]
    pub fn backend(code: RpcCode, message: impl Into<String>) -> Self {
        Self::Backend {
            code,
            message: message.into(),
        }
    }

    /// CoAP response code a device receives for this error.
    #[must_use]
    pub const fn coap_code(&self) -> Code {
        match self {
            Self::Unauthenticated(_) | Self::Unauthorized(_) => Code::Unauthorized,
            Self::Forbidden(_) => Code::Forbidden,
            Self::BadRequest(_) => Code::BadRequest,
            Self::NotFound(_) => Code::NotFound,
            Self::ServiceUnavailable(_) | Self::ConnectionClosed => Code::ServiceUnavailable,
            Self::Timeout(_) => Code::GatewayTimeout,
            Self::Backend { code, .. } => {
                twin_proto::rpc_code_to_coap_code(*code, twin_proto::Operation::Update)
            }
            Self::UnstableContainer(_) | Self::Internal(_) => Code::InternalServerError,
        }
    }
}

impl From<ProtoError> for GatewayError {
    fn from(err: ProtoError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(GatewayError::Unauthenticated("x".into()), Code::Unauthorized)]
    #[test_case(GatewayError::Unauthorized("x".into()), Code::Unauthorized)]
    #[test_case(GatewayError::Forbidden("x".into()), Code::Forbidden)]
    #[test_case(GatewayError::BadRequest("x".into()), Code::BadRequest)]
    #[test_case(GatewayError::NotFound("x".into()), Code::NotFound)]
    #[test_case(GatewayError::ServiceUnavailable("x".into()), Code::ServiceUnavailable)]
    #[test_case(GatewayError::Timeout("x".into()), Code::GatewayTimeout)]
    #[test_case(GatewayError::UnstableContainer("x".into()), Code::InternalServerError)]
    #[test_case(GatewayError::backend(RpcCode::PermissionDenied, "x"), Code::Forbidden)]
    fn test_error_coap_code(err: GatewayError, expected: Code) {
        assert_eq!(err.coap_code(), expected);
    }

    #[test]
    fn test_from_proto_error_is_bad_request() {
        let err: GatewayError = ProtoError::MissingField("di").into();
        assert!(matches!(err, GatewayError::BadRequest(_)));
        assert!(err.to_string().contains("di"));
    }

    #[test]
    fn test_backend_error_display() {
        let err = GatewayError::backend(RpcCode::Unavailable, "down");
        assert_eq!(err.to_string(), "backend error (Unavailable): down");
    }
}
