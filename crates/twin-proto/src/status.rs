//! Backend status and RPC error codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status the backend attaches to confirmations and resource content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Status not set.
    #[default]
    Unknown,
    /// Operation succeeded.
    Ok,
    /// Malformed request.
    BadRequest,
    /// Caller not authenticated.
    Unauthorized,
    /// Caller not allowed.
    Forbidden,
    /// Resource absent.
    NotFound,
    /// Device or backend unreachable.
    Unavailable,
    /// Operation not implemented by the device.
    NotImplemented,
    /// Accepted for later processing.
    Accepted,
    /// Generic failure.
    Error,
    /// Method not allowed on the resource.
    MethodNotAllowed,
    /// Resource created.
    Created,
    /// Operation canceled.
    Canceled,
    /// Content unchanged since the last retrieve.
    NotModified,
}

impl Status {
    /// True for statuses representing success.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::Created | Self::Accepted | Self::NotModified)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Kind of resource operation a code translation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Update of resource content.
    Update,
    /// Retrieve of resource content.
    Retrieve,
    /// Deletion of a resource.
    Delete,
    /// Creation of a sub-resource.
    Create,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Update => "update",
            Self::Retrieve => "retrieve",
            Self::Delete => "delete",
            Self::Create => "create",
        };
        f.write_str(s)
    }
}

/// RPC error codes returned by backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCode {
    /// Success.
    Ok,
    /// Call canceled by the caller.
    Canceled,
    /// Unknown failure.
    Unknown,
    /// Malformed argument.
    InvalidArgument,
    /// Deadline passed before completion.
    DeadlineExceeded,
    /// Entity absent.
    NotFound,
    /// Entity already exists.
    AlreadyExists,
    /// Caller lacks permission.
    PermissionDenied,
    /// Quota or capacity exhausted.
    ResourceExhausted,
    /// System not in a state allowing the call.
    FailedPrecondition,
    /// Concurrency conflict.
    Aborted,
    /// Argument out of range.
    OutOfRange,
    /// Operation not implemented.
    Unimplemented,
    /// Internal failure.
    Internal,
    /// Service unavailable.
    Unavailable,
    /// Unrecoverable data loss.
    DataLoss,
    /// Missing or invalid credentials.
    Unauthenticated,
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
