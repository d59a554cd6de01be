//! Commands the gateway submits to the device-twin backend.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::events::{Content, EventEnvelope, ResourceLink};
use crate::status::{Operation, Status};
use crate::types::{CorrelationId, DeviceId, ResourceId};

/// Minimum time-to-live accepted for a service heartbeat.
pub const MIN_HEARTBEAT_TTL: Duration = Duration::from_secs(1);

/// Connectivity of a device as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Device holds a live session.
    Online,
    /// Device is disconnected.
    Offline,
}

/// Progress of synchronizing the device twin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwinSyncState {
    /// Observations are being established.
    Syncing,
    /// All published resources are observed.
    InSync,
    /// Synchronization stopped.
    Disabled,
}

/// Device metadata change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMetadataUpdate {
    /// Connection status report.
    Connection {
        /// New status.
        status: ConnectionStatus,
        /// When the device connected.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connected_at: Option<DateTime<Utc>>,
        /// Gateway instance reporting the status.
        service_id: String,
        /// Until when the status holds without a refresh.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        valid_until: Option<DateTime<Utc>>,
        /// Transport protocol tag.
        protocol: String,
        /// Endpoints where the gateway instance is reachable.
        #[serde(default)]
        local_endpoints: Vec<String>,
    },
    /// Twin synchronization progress.
    TwinSynchronization {
        /// New state.
        state: TwinSyncState,
    },
}

/// Liveness report of a gateway instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHeartbeat {
    /// Reporting instance.
    pub service_id: String,
    /// How long the report stays valid.
    pub time_to_live: Duration,
}

impl ServiceHeartbeat {
    /// Check the heartbeat is acceptable to the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the service ID is empty or the TTL is below one second.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.service_id.is_empty() {
            return Err(ProtoError::Validation("invalid heartbeat.serviceId".to_string()));
        }
        if self.time_to_live < MIN_HEARTBEAT_TTL {
            return Err(ProtoError::Validation(format!(
                "invalid heartbeat.timeToLive({:?}): is less than 1s",
                self.time_to_live
            )));
        }
        Ok(())
    }
}

/// A command for the resource aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Publish resource links of a device.
    PublishResourceLinks {
        /// Publishing device.
        device_id: DeviceId,
        /// Links to publish.
        links: Vec<ResourceLink>,
        /// Link time-to-live in seconds, 0 for infinite.
        ttl: i64,
    },
    /// Unpublish resource links; empty `hrefs` and `instance_ids` unpublish all.
    UnpublishResourceLinks {
        /// Owning device.
        device_id: DeviceId,
        /// Hrefs to unpublish.
        hrefs: Vec<String>,
        /// Instance IDs to unpublish.
        instance_ids: Vec<i64>,
    },
    /// Content observed on the device.
    NotifyResourceChanged {
        /// Changed resource.
        resource_id: ResourceId,
        /// New content.
        content: Content,
        /// Status reported by the device.
        status: Status,
    },
    /// Ask for a device-side update.
    UpdateResource {
        /// Target resource.
        resource_id: ResourceId,
        /// Correlation of the request.
        correlation_id: CorrelationId,
        /// New content.
        content: Content,
        /// Interface to update through.
        interface: Option<String>,
    },
    /// Ask for a device-side retrieve.
    RetrieveResource {
        /// Target resource.
        resource_id: ResourceId,
        /// Correlation of the request.
        correlation_id: CorrelationId,
        /// Interface to retrieve through.
        interface: Option<String>,
    },
    /// Ask for a device-side create.
    CreateResource {
        /// Collection resource.
        resource_id: ResourceId,
        /// Correlation of the request.
        correlation_id: CorrelationId,
        /// Content of the new resource.
        content: Content,
    },
    /// Ask for a device-side delete.
    DeleteResource {
        /// Target resource.
        resource_id: ResourceId,
        /// Correlation of the request.
        correlation_id: CorrelationId,
    },
    /// Report the device's answer to a pending command.
    ConfirmResource {
        /// Which pending operation is confirmed.
        operation: Operation,
        /// Target resource.
        resource_id: ResourceId,
        /// Correlation of the pending command.
        correlation_id: CorrelationId,
        /// Outcome.
        status: Status,
        /// Response content.
        content: Content,
    },
    /// Change device metadata.
    UpdateDeviceMetadata {
        /// Target device.
        device_id: DeviceId,
        /// The change.
        update: DeviceMetadataUpdate,
    },
    /// Gateway instance heartbeat.
    UpdateServiceMetadata {
        /// The heartbeat.
        heartbeat: ServiceHeartbeat,
    },
    /// Remove devices from the backend.
    DeleteDevices {
        /// Devices to remove.
        device_ids: Vec<DeviceId>,
    },
}

impl Command {
    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PublishResourceLinks { .. } => "publish_resource_links",
            Self::UnpublishResourceLinks { .. } => "unpublish_resource_links",
            Self::NotifyResourceChanged { .. } => "notify_resource_changed",
            Self::UpdateResource { .. } => "update_resource",
            Self::RetrieveResource { .. } => "retrieve_resource",
            Self::CreateResource { .. } => "create_resource",
            Self::DeleteResource { .. } => "delete_resource",
            Self::ConfirmResource { .. } => "confirm_resource",
            Self::UpdateDeviceMetadata { .. } => "update_device_metadata",
            Self::UpdateServiceMetadata { .. } => "update_service_metadata",
            Self::DeleteDevices { .. } => "delete_devices",
        }
    }

    /// Validate the command before submission.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<(), ProtoError> {
        match self {
            Self::PublishResourceLinks { device_id, links, .. } => {
                if device_id.is_empty() {
                    return Err(ProtoError::MissingField("device_id"));
                }
                if links.is_empty() {
                    return Err(ProtoError::Validation("empty links".to_string()));
                }
                Ok(())
            }
            Self::UnpublishResourceLinks { device_id, .. }
            | Self::UpdateDeviceMetadata { device_id, .. } => {
                if device_id.is_empty() {
                    return Err(ProtoError::MissingField("device_id"));
                }
                Ok(())
            }
            Self::UpdateServiceMetadata { heartbeat } => heartbeat.validate(),
            Self::DeleteDevices { device_ids } => {
                if device_ids.is_empty() {
                    return Err(ProtoError::MissingField("device_ids"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Build a confirmation of a pending operation.
    #[must_use]
    pub fn confirm(
        operation: Operation,
        resource_id: ResourceId,
        correlation_id: CorrelationId,
        status: Status,
        content: Content,
    ) -> Self {
        Self::ConfirmResource {
            operation,
            resource_id,
            correlation_id,
            status,
            content,
        }
    }
}

/// Result of a submitted command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Events produced by the command.
    #[serde(default)]
    pub events: Vec<EventEnvelope>,
    /// Validity granted by a heartbeat or status update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}
