//! # twin-gateway
//!
//! Core of the CoAP device gateway: bridges long-lived device connections to
//! an event-sourced device-twin backend.
//!
//! - [`Service`] - Shared registries and the session lifecycle
//! - [`Session`] - One device connection: auth state, observations, relays
//! - [`Projection`] - Per-resource fold of backend events driving fan-out and
//!   pending-command relay
//! - [`ObservationContainer`] - Process-wide registry of cloud observers
//! - [`start_service_heartbeat`] - Instance liveness reporting
//!
//! Backend collaborators are traits in [`backend`]; [`memory`] implements
//! them in process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod backend;
pub mod config;
pub mod connection;
pub mod device_observer;
pub mod error;
pub mod expiration;
mod handlers;
pub mod heartbeat;
pub mod memory;
pub mod observation;
pub mod projection;
pub mod service;
pub mod session;
pub mod session_index;
pub mod status_updater;
pub mod subscription;
pub mod token_cache;
pub mod waiters;
pub mod worker_pool;

pub use auth::{AuthorizationContext, Claims, JwtSigner, JwtValidator, TokenValidator};
pub use backend::{
    BoxFuture, EventBus, EventFilter, EventHandler, IdentityProvider, IdentityStore,
    ResourceAggregate, ResourceDirectory, ResourceFilter, ResourceSnapshot, ServiceTokenProvider,
    Subscription, TokenGrant,
};
pub use config::{ServiceConfig, StatusValidity};
pub use connection::{DeviceConnection, DeviceObservation, NotifyFn};
pub use error::{GatewayError, GatewayResult};
pub use heartbeat::{start_service_heartbeat, HeartbeatConfig, HeartbeatHandle, Terminator};
pub use observation::{ObservationContainer, Observer};
pub use projection::{Projection, ResourceCtx};
pub use service::{Backends, Service, ServiceContext};
pub use session::Session;
pub use worker_pool::{BoundedPool, ShardedPool};
