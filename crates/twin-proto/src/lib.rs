//! # twin-proto
//!
//! Protocol definitions shared by the device-twin gateway: resource identifiers,
//! the CoAP message model devices speak, backend status codes, the resource
//! event stream and the commands the gateway submits to the backend.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod coap;
pub mod commands;
pub mod convert;
pub mod error;
pub mod events;
pub mod messages;
pub mod status;
pub mod types;
pub mod uri;

pub use coap::{Code, MediaType, Message};
pub use commands::{
    Command, CommandResponse, ConnectionStatus, DeviceMetadataUpdate, ServiceHeartbeat,
    TwinSyncState,
};
pub use convert::{coap_code_to_status, rpc_code_to_coap_code, status_to_coap_code};
pub use error::ProtoError;
pub use events::{
    AuditContext, BusEvent, Content, EventEnvelope, PendingCommand, ResourceChanged,
    ResourceCompleted, ResourceEvent, ResourceLink,
};
pub use status::{Operation, RpcCode, Status};
pub use types::{normalize_href, CorrelationId, DeviceId, ResourceId, Token};
