//! Translation between CoAP codes, backend statuses and RPC error codes.

use crate::coap::Code;
use crate::status::{Operation, RpcCode, Status};

/// Map a backend status to the CoAP response code sent to a device.
///
/// `MethodNotAllowed` and every status without an explicit mapping fall back
/// to `BadRequest`.
#[must_use]
pub const fn status_to_coap_code(status: Status, operation: Operation) -> Code {
    match status {
        Status::Ok => success_code(operation),
        Status::Created => Code::Created,
        Status::NotModified | Status::Accepted => Code::Valid,
        Status::BadRequest => Code::BadRequest,
        Status::Unauthorized => Code::Unauthorized,
        Status::Forbidden => Code::Forbidden,
        Status::NotFound => Code::NotFound,
        Status::Unavailable => Code::ServiceUnavailable,
        Status::NotImplemented => Code::NotImplemented,
        _ => Code::BadRequest,
    }
}

/// Map a device response code to the status confirmed to the backend.
#[must_use]
pub const fn coap_code_to_status(code: Code, operation: Operation) -> Status {
    match code {
        Code::Changed | Code::Content | Code::Deleted => Status::Ok,
        Code::Valid => match operation {
            Operation::Retrieve => Status::NotModified,
            _ => Status::Accepted,
        },
        Code::BadRequest => Status::BadRequest,
        Code::Unauthorized => Status::Unauthorized,
        Code::Forbidden => Status::Forbidden,
        Code::NotFound => Status::NotFound,
        Code::ServiceUnavailable => Status::Unavailable,
        Code::NotImplemented => Status::NotImplemented,
        Code::MethodNotAllowed => Status::MethodNotAllowed,
        Code::Created => Status::Created,
        _ => Status::Error,
    }
}

/// Map an RPC error code from a backend call to a CoAP response code.
#[must_use]
pub const fn rpc_code_to_coap_code(code: RpcCode, operation: Operation) -> Code {
    match code {
        RpcCode::Ok => success_code(operation),
        RpcCode::InvalidArgument | RpcCode::OutOfRange | RpcCode::FailedPrecondition => {
            Code::BadRequest
        }
        RpcCode::Unauthenticated => Code::Unauthorized,
        RpcCode::PermissionDenied => Code::Forbidden,
        RpcCode::NotFound => Code::NotFound,
        RpcCode::AlreadyExists => match operation {
            Operation::Create => Code::PreconditionFailed,
            _ => Code::BadRequest,
        },
        RpcCode::Unimplemented => Code::NotImplemented,
        RpcCode::DeadlineExceeded => Code::GatewayTimeout,
        RpcCode::Unavailable | RpcCode::ResourceExhausted | RpcCode::Aborted => {
            Code::ServiceUnavailable
        }
        RpcCode::Canceled
        | RpcCode::Unknown
        | RpcCode::Internal
        | RpcCode::DataLoss => Code::InternalServerError,
    }
}

const fn success_code(operation: Operation) -> Code {
    match operation {
        Operation::Update => Code::Changed,
        Operation::Retrieve => Code::Content,
        Operation::Delete => Code::Deleted,
        Operation::Create => Code::Created,
    }
}
