//! Contracts of the external collaborators the gateway consumes.
//!
//! The device-twin backend is reached only through these traits: command
//! submission, event subscription, the resource directory read path, the
//! identity store, identity providers and a source of service credentials.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use twin_proto::{
    BusEvent, Command, CommandResponse, DeviceId, EventEnvelope, ResourceChanged, ResourceId,
    ResourceLink,
};
use uuid::Uuid;

use crate::error::GatewayResult;

/// A boxed future for use in object-safe traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Tokens issued by an identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Owner the tokens were issued for.
    pub user_id: String,
    /// Access token expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Redirect URI returned by the provider.
    pub redirect_uri: String,
}

impl TokenGrant {
    /// Create a non-expiring grant.
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            user_id: user_id.into(),
            expires_at: None,
            redirect_uri: String::new(),
        }
    }

    /// Set the expiry.
    #[must_use]
    pub const fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }
}

/// Submits commands to the resource aggregate.
pub trait ResourceAggregate: Send + Sync {
    /// Submit `command` on behalf of the holder of `token`.
    fn submit<'a>(
        &'a self,
        token: &'a str,
        command: Command,
    ) -> BoxFuture<'a, GatewayResult<CommandResponse>>;
}

/// Selects resources from the resource directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    /// Match all resources of these devices.
    pub device_ids: Vec<DeviceId>,
    /// Match these resources.
    pub resource_ids: Vec<ResourceId>,
}

impl ResourceFilter {
    /// All resources of one device.
    #[must_use]
    pub fn device(device_id: DeviceId) -> Self {
        Self {
            device_ids: vec![device_id],
            resource_ids: Vec::new(),
        }
    }

    /// A single resource.
    #[must_use]
    pub fn resource(resource_id: ResourceId) -> Self {
        Self {
            device_ids: Vec::new(),
            resource_ids: vec![resource_id],
        }
    }

    /// True when `id` is selected.
    #[must_use]
    pub fn matches(&self, id: &ResourceId) -> bool {
        self.device_ids.contains(&id.device_id) || self.resource_ids.contains(id)
    }
}

/// Current state of one resource as served by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Resource descriptor.
    pub resource: ResourceLink,
    /// Publication flag.
    pub is_published: bool,
    /// Latest content.
    pub latest: Option<ResourceChanged>,
    /// Aggregate version the snapshot reflects.
    pub version: u64,
    /// Pending commands not yet confirmed, oldest first.
    pub pending: Vec<EventEnvelope>,
}

/// Read path of the device twin.
pub trait ResourceDirectory: Send + Sync {
    /// Resources matching `filter`.
    fn get_resources<'a>(
        &'a self,
        token: &'a str,
        filter: &'a ResourceFilter,
    ) -> BoxFuture<'a, GatewayResult<Vec<ResourceSnapshot>>>;
}

/// Receives ordered batches of bus events.
///
/// Returning an error asks the bus to redeliver the whole batch, so handlers
/// must tolerate events they already applied.
pub trait EventHandler: Send + Sync {
    /// Handle one batch.
    fn handle(&self, events: Vec<BusEvent>) -> BoxFuture<'_, GatewayResult<()>>;
}

/// Selects which devices' events a subscriber receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// `None` subscribes to every device.
    pub device_ids: Option<HashSet<DeviceId>>,
}

impl EventFilter {
    /// Every device.
    #[must_use]
    pub const fn all() -> Self {
        Self { device_ids: None }
    }

    /// A single device.
    #[must_use]
    pub fn device(device_id: DeviceId) -> Self {
        Self {
            device_ids: Some(HashSet::from([device_id])),
        }
    }

    /// True when the event passes the filter.
    #[must_use]
    pub fn matches(&self, event: &BusEvent) -> bool {
        self.device_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(event.device_id()))
    }
}

/// Live subscription; closing it stops delivery.
pub struct Subscription {
    id: Uuid,
    close: Option<Box<dyn FnOnce(Uuid) + Send + Sync>>,
}

impl Subscription {
    /// Wrap a subscription with its close action.
    #[must_use]
    pub fn new(id: Uuid, close: impl FnOnce(Uuid) + Send + Sync + 'static) -> Self {
        Self {
            id,
            close: Some(Box::new(close)),
        }
    }

    /// Subscription ID.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Stop delivery.
    pub fn close(mut self) {
        if let Some(close) = self.close.take() {
            close(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Delivers backend events to subscribers.
pub trait EventBus: Send + Sync {
    /// Subscribe `handler` to events matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus rejects the subscription.
    fn subscribe(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> GatewayResult<Subscription>;
}

/// Device ownership records.
pub trait IdentityStore: Send + Sync {
    /// Record `device_id` as owned by `owner`.
    fn add_device<'a>(
        &'a self,
        owner: &'a str,
        device_id: &'a DeviceId,
    ) -> BoxFuture<'a, GatewayResult<()>>;

    /// Remove devices owned by `owner`; returns the removed IDs.
    fn delete_devices<'a>(
        &'a self,
        owner: &'a str,
        device_ids: &'a [DeviceId],
    ) -> BoxFuture<'a, GatewayResult<Vec<DeviceId>>>;

    /// True when `owner` owns `device_id`.
    fn is_owner<'a>(
        &'a self,
        owner: &'a str,
        device_id: &'a DeviceId,
    ) -> BoxFuture<'a, GatewayResult<bool>>;
}

/// OAuth identity provider.
pub trait IdentityProvider: Send + Sync {
    /// Provider name devices select with `authprovider`.
    fn name(&self) -> &str;

    /// Exchange an authorization code for tokens.
    fn exchange<'a>(&'a self, code: &'a str) -> BoxFuture<'a, GatewayResult<TokenGrant>>;

    /// Refresh tokens.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, GatewayResult<TokenGrant>>;
}

/// Issues the service-level credential used when the backend drives a call.
pub trait ServiceTokenProvider: Send + Sync {
    /// Current service token.
    fn service_token(&self) -> BoxFuture<'_, GatewayResult<String>>;
}
