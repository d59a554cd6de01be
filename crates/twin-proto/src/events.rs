//! Resource events emitted by the device-twin backend.
//!
//! The backend stream is decoded once at the bus boundary into the closed
//! [`ResourceEvent`] union; consumers never dispatch on type strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coap::MediaType;
use crate::error::ProtoError;
use crate::status::Status;
use crate::types::{CorrelationId, DeviceId, ResourceId};

/// Resource content as stored by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// MIME type of `data`, empty when there is no payload.
    #[serde(default)]
    pub content_type: String,
    /// Raw payload.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Content {
    /// Content with a known media type.
    #[must_use]
    pub fn new(media_type: MediaType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: media_type.as_str().to_string(),
            data: data.into(),
        }
    }

    /// Content carrying no payload.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parsed media type, `None` when the content carries none.
    ///
    /// # Errors
    ///
    /// Returns an error when the content type is set but unsupported.
    pub fn media_type(&self) -> Result<Option<MediaType>, ProtoError> {
        if self.content_type.is_empty() {
            return Ok(None);
        }
        MediaType::parse(&self.content_type).map(Some)
    }
}

/// Resource policy bitmask as published by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Bitmask: 1 discoverable, 2 observable.
    #[serde(default)]
    pub bm: u8,
}

/// A published resource link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
    /// Resource href.
    pub href: String,
    /// Owning device.
    #[serde(rename = "di", default = "empty_device_id")]
    pub device_id: DeviceId,
    /// Resource types.
    #[serde(rename = "rt", default)]
    pub resource_types: Vec<String>,
    /// Supported interfaces.
    #[serde(rename = "if", default)]
    pub interfaces: Vec<String>,
    /// Resource policy.
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
    /// Instance ID assigned by the device.
    #[serde(rename = "ins", default)]
    pub instance_id: i64,
}

fn empty_device_id() -> DeviceId {
    DeviceId::new("")
}

impl ResourceLink {
    /// Bit set in [`Policy::bm`] for observable resources.
    pub const OBSERVABLE: u8 = 0x02;

    /// Create a link for `href` on `device_id`.
    #[must_use]
    pub fn new(device_id: DeviceId, href: &str) -> Self {
        Self {
            href: crate::types::normalize_href(href),
            device_id,
            resource_types: Vec::new(),
            interfaces: Vec::new(),
            policy: None,
            instance_id: 0,
        }
    }

    /// Mark the link observable.
    #[must_use]
    pub fn observable(mut self) -> Self {
        self.policy = Some(Policy {
            bm: self.policy.map_or(0, |p| p.bm) | Self::OBSERVABLE,
        });
        self
    }

    /// Add a resource type.
    #[must_use]
    pub fn with_resource_type(mut self, rt: impl Into<String>) -> Self {
        self.resource_types.push(rt.into());
        self
    }

    /// True when the policy advertises observability.
    #[must_use]
    pub fn is_observable(&self) -> bool {
        self.policy.is_some_and(|p| p.bm & Self::OBSERVABLE != 0)
    }

    /// Identity of the linked resource.
    #[must_use]
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.device_id.clone(), &self.href)
    }
}

/// Who caused an event and which request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    /// User on whose behalf the command ran.
    pub user_id: String,
    /// Correlation of the originating command.
    pub correlation_id: CorrelationId,
}

impl AuditContext {
    /// Build an audit context.
    #[must_use]
    pub fn new(user_id: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            user_id: user_id.into(),
            correlation_id,
        }
    }
}

/// Latest content reported for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChanged {
    /// New content.
    pub content: Content,
    /// Status the device reported with the content.
    pub status: Status,
}

/// A backend-issued command waiting to be relayed to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Target resource.
    pub resource_id: ResourceId,
    /// Issuer and correlation.
    pub audit: AuditContext,
    /// Content for update/create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// Resource interface (`if=` query) to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

impl PendingCommand {
    /// Correlation ID of the pending command.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.audit.correlation_id
    }
}

/// Completion of a pending command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCompleted {
    /// Target resource.
    pub resource_id: ResourceId,
    /// Issuer and correlation.
    pub audit: AuditContext,
    /// Outcome reported by the device.
    pub status: Status,
    /// Response content.
    #[serde(default)]
    pub content: Content,
}

impl ResourceCompleted {
    /// Correlation ID of the completed command.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.audit.correlation_id
    }
}

/// Events of one resource aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceEvent {
    /// Full state of the aggregate.
    Snapshot {
        /// Resource descriptor, if known.
        resource: Option<ResourceLink>,
        /// Publication flag.
        is_published: bool,
        /// Latest content, if any.
        latest: Option<ResourceChanged>,
    },
    /// Resource published by its device.
    Published {
        /// Resource descriptor.
        resource: ResourceLink,
    },
    /// Resource unpublished.
    Unpublished,
    /// Resource content changed.
    Changed(ResourceChanged),
    /// Update requested.
    UpdatePending(PendingCommand),
    /// Update confirmed.
    Updated(ResourceCompleted),
    /// Retrieve requested.
    RetrievePending(PendingCommand),
    /// Retrieve confirmed.
    Retrieved(ResourceCompleted),
    /// Create requested.
    CreatePending(PendingCommand),
    /// Create confirmed.
    Created(ResourceCompleted),
    /// Delete requested.
    DeletePending(PendingCommand),
    /// Delete confirmed.
    Deleted(ResourceCompleted),
}

impl ResourceEvent {
    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Published { .. } => "published",
            Self::Unpublished => "unpublished",
            Self::Changed(_) => "changed",
            Self::UpdatePending(_) => "update_pending",
            Self::Updated(_) => "updated",
            Self::RetrievePending(_) => "retrieve_pending",
            Self::Retrieved(_) => "retrieved",
            Self::CreatePending(_) => "create_pending",
            Self::Created(_) => "created",
            Self::DeletePending(_) => "delete_pending",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// One event of a resource aggregate with its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Aggregate the event belongs to.
    pub resource_id: ResourceId,
    /// Aggregate version, strictly increasing per resource.
    pub version: u64,
    /// When the backend recorded the event.
    pub timestamp: DateTime<Utc>,
    /// The event.
    pub event: ResourceEvent,
}

impl EventEnvelope {
    /// Wrap an event stamped with the current time.
    #[must_use]
    pub fn new(resource_id: ResourceId, version: u64, event: ResourceEvent) -> Self {
        Self {
            resource_id,
            version,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Anything delivered on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusEvent {
    /// Event of a resource aggregate.
    Resource(EventEnvelope),
    /// Device removed from the backend.
    DeviceUnregistered {
        /// Removed device.
        device_id: DeviceId,
    },
}

impl BusEvent {
    /// Device the event concerns.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        match self {
            Self::Resource(envelope) => &envelope.resource_id.device_id,
            Self::DeviceUnregistered { device_id } => device_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> ResourceLink {
        ResourceLink::new(DeviceId::new("dev"), "light/1")
    }

    // ==================== Content Tests ====================

    #[test]
    fn test_content_media_type() {
        let content = Content::new(MediaType::AppJson, b"{}".to_vec());
        assert_eq!(content.media_type().unwrap(), Some(MediaType::AppJson));
        assert_eq!(Content::empty().media_type().unwrap(), None);
    }

    #[test]
    fn test_content_unknown_media_type() {
        let content = Content {
            content_type: "image/png".to_string(),
            data: vec![],
        };
        assert!(content.media_type().is_err());
    }

    // ==================== ResourceLink Tests ====================

    #[test]
    fn test_link_normalizes_href() {
        assert_eq!(link().href, "/light/1");
        assert_eq!(link().resource_id().to_string(), "/dev/light/1");
    }

    #[test]
    fn test_link_observable_flag() {
        assert!(!link().is_observable());
        assert!(link().observable().is_observable());
    }

    #[test]
    fn test_link_device_wire_format() {
        let json = r#"{"href":"/light/1","rt":["oic.r.switch.binary"],"if":["oic.if.a"],"p":{"bm":3}}"#;
        let link: ResourceLink = serde_json::from_str(json).unwrap();
        assert!(link.device_id.is_empty());
        assert_eq!(link.resource_types, vec!["oic.r.switch.binary"]);
        assert!(link.is_observable());
    }

    // ==================== ResourceEvent Tests ====================

    #[test]
    fn test_event_tagged_serialization() {
        let event = ResourceEvent::Published { resource: link() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "published");
        let back: ResourceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(ResourceEvent::Unpublished.kind(), "unpublished");
        let pending = PendingCommand {
            resource_id: link().resource_id(),
            audit: AuditContext::new("user", CorrelationId::new("c1")),
            content: None,
            interface: None,
        };
        assert_eq!(ResourceEvent::RetrievePending(pending).kind(), "retrieve_pending");
    }

    #[test]
    fn test_bus_event_device_id() {
        let envelope = EventEnvelope::new(link().resource_id(), 1, ResourceEvent::Unpublished);
        assert_eq!(BusEvent::Resource(envelope).device_id().as_str(), "dev");
        let unregistered = BusEvent::DeviceUnregistered {
            device_id: DeviceId::new("x"),
        };
        assert_eq!(unregistered.device_id().as_str(), "x");
    }
}
