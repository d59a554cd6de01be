//! Reports device connection status to the backend.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use twin_proto::{Command, ConnectionStatus, DeviceId, DeviceMetadataUpdate};

use crate::auth::AuthorizationContext;
use crate::backend::ResourceAggregate;
use crate::config::{ServiceConfig, StatusValidity};
use crate::error::GatewayResult;

#[derive(Debug, Clone)]
struct OnlineDevice {
    access_token: String,
    connected_at: DateTime<Utc>,
    token_expires_at: Option<DateTime<Utc>>,
}

/// Reports devices online and offline.
///
/// With a fixed validity window the online report of every tracked device is
/// renewed before its window closes.
pub struct DevicesStatusUpdater {
    aggregate: Arc<dyn ResourceAggregate>,
    service_id: String,
    protocol: String,
    local_endpoints: Vec<String>,
    validity: StatusValidity,
    online: Mutex<HashMap<DeviceId, OnlineDevice>>,
}

impl DevicesStatusUpdater {
    /// Create an updater reporting through `aggregate`.
    #[must_use]
    pub fn new(aggregate: Arc<dyn ResourceAggregate>, config: &ServiceConfig) -> Self {
        Self {
            aggregate,
            service_id: config.instance_id.clone(),
            protocol: config.protocol.clone(),
            local_endpoints: config.local_endpoints.clone(),
            validity: config.status_validity,
            online: Mutex::new(HashMap::new()),
        }
    }

    fn valid_until(&self, token_expires_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self.validity {
            StatusValidity::TokenExpiry => token_expires_at,
            StatusValidity::FixedTtl(ttl) => chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| Utc::now() + ttl),
        }
    }

    async fn submit_online(&self, device_id: &DeviceId, device: &OnlineDevice) -> GatewayResult<Option<DateTime<Utc>>> {
        let valid_until = self.valid_until(device.token_expires_at);
        let command = Command::UpdateDeviceMetadata {
            device_id: device_id.clone(),
            update: DeviceMetadataUpdate::Connection {
                status: ConnectionStatus::Online,
                connected_at: Some(device.connected_at),
                service_id: self.service_id.clone(),
                valid_until,
                protocol: self.protocol.clone(),
                local_endpoints: self.local_endpoints.clone(),
            },
        };
        let response = self.aggregate.submit(&device.access_token, command).await?;
        Ok(response.valid_until.or(valid_until))
    }

    /// Report the device of `auth` online and start tracking it.
    ///
    /// Returns until when the status holds, `None` for no limit.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the device is not tracked then.
    pub async fn update_online(
        &self,
        auth: &AuthorizationContext,
        connected_at: DateTime<Utc>,
    ) -> GatewayResult<Option<DateTime<Utc>>> {
        let device = OnlineDevice {
            access_token: auth.access_token.clone(),
            connected_at,
            token_expires_at: auth.expires_at,
        };
        let valid_until = self.submit_online(&auth.device_id, &device).await?;
        self.online.lock().insert(auth.device_id.clone(), device);
        debug!(device_id = %auth.device_id, ?valid_until, "device online");
        Ok(valid_until)
    }

    /// Report `device_id` offline and stop tracking it.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn update_offline(&self, device_id: &DeviceId, token: &str) -> GatewayResult<()> {
        self.online.lock().remove(device_id);
        let command = Command::UpdateDeviceMetadata {
            device_id: device_id.clone(),
            update: DeviceMetadataUpdate::Connection {
                status: ConnectionStatus::Offline,
                connected_at: None,
                service_id: self.service_id.clone(),
                valid_until: None,
                protocol: self.protocol.clone(),
                local_endpoints: self.local_endpoints.clone(),
            },
        };
        self.aggregate.submit(token, command).await?;
        Ok(())
    }

    /// True while `device_id` is tracked as online.
    #[must_use]
    pub fn is_online(&self, device_id: &DeviceId) -> bool {
        self.online.lock().contains_key(device_id)
    }

    /// Renew the online report of every tracked device.
    pub async fn refresh(&self) {
        let devices: Vec<_> = self
            .online
            .lock()
            .iter()
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect();
        for (device_id, device) in devices {
            if let Err(e) = self.submit_online(&device_id, &device).await {
                warn!(%device_id, error = %e, "cannot renew online status");
            }
        }
    }

    /// Periodically renew online reports when the validity window is fixed.
    ///
    /// Returns `None` when validity follows token expiry.
    pub fn start_refresh(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let StatusValidity::FixedTtl(ttl) = self.validity else {
            return None;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = (ttl / 2).max(Duration::from_millis(100));
        Some(tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(period);
            interval_timer.tick().await;
            loop {
                interval_timer.tick().await;
                let Some(updater) = weak.upgrade() else {
                    break;
                };
                updater.refresh().await;
            }
        }))
    }
}

impl std::fmt::Debug for DevicesStatusUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicesStatusUpdater")
            .field("service_id", &self.service_id)
            .field("validity", &self.validity)
            .field("online", &self.online.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twin_proto::RpcCode;

    use crate::memory::InMemoryBackend;

    fn status_updater(validity: StatusValidity) -> (Arc<InMemoryBackend>, Arc<DevicesStatusUpdater>) {
        let backend = InMemoryBackend::new("service-token");
        let config = ServiceConfig::new()
            .with_instance_id("gw-status")
            .with_status_validity(validity);
        let updater = Arc::new(DevicesStatusUpdater::new(backend.clone(), &config));
        (backend, updater)
    }

    fn auth(device: &str, expires_at: Option<DateTime<Utc>>) -> AuthorizationContext {
        AuthorizationContext::new(DeviceId::new(device), "alice", "device-token", expires_at)
    }

    /// (status, valid_until) of every connection report for `device`.
    fn reports(
        backend: &InMemoryBackend,
        device: &str,
    ) -> Vec<(ConnectionStatus, Option<DateTime<Utc>>)> {
        backend
            .device_metadata(&DeviceId::new(device))
            .into_iter()
            .filter_map(|update| match update {
                DeviceMetadataUpdate::Connection {
                    status,
                    valid_until,
                    ..
                } => Some((status, valid_until)),
                DeviceMetadataUpdate::TwinSynchronization { .. } => None,
            })
            .collect()
    }

    // ==================== Validity Tests ====================

    #[tokio::test]
    async fn test_token_expiry_validity_follows_token() {
        let (backend, updater) = status_updater(StatusValidity::TokenExpiry);
        let expires_at = Utc::now() + chrono::Duration::hours(1);

        let valid_until = updater
            .update_online(&auth("dev-1", Some(expires_at)), Utc::now())
            .await
            .unwrap();

        assert_eq!(valid_until, Some(expires_at));
        assert_eq!(
            reports(&backend, "dev-1"),
            vec![(ConnectionStatus::Online, Some(expires_at))]
        );
        assert!(updater.is_online(&DeviceId::new("dev-1")));
    }

    #[tokio::test]
    async fn test_token_without_expiry_is_unbounded() {
        let (_backend, updater) = status_updater(StatusValidity::TokenExpiry);
        let valid_until = updater
            .update_online(&auth("dev-1", None), Utc::now())
            .await
            .unwrap();
        assert_eq!(valid_until, None);
    }

    #[tokio::test]
    async fn test_fixed_ttl_ignores_token_expiry() {
        let (_backend, updater) = status_updater(StatusValidity::FixedTtl(Duration::from_secs(30)));
        let expires_at = Utc::now() + chrono::Duration::hours(1);
        let before = Utc::now();

        let valid_until = updater
            .update_online(&auth("dev-1", Some(expires_at)), before)
            .await
            .unwrap()
            .unwrap();

        assert!(valid_until >= before + chrono::Duration::seconds(30));
        assert!(valid_until < expires_at);
    }

    #[tokio::test]
    async fn test_failed_online_report_is_not_tracked() {
        let (backend, updater) = status_updater(StatusValidity::TokenExpiry);
        backend.fail_commands("update_device_metadata", 1, RpcCode::Unavailable);

        let result = updater.update_online(&auth("dev-1", None), Utc::now()).await;
        assert!(result.is_err());
        assert!(!updater.is_online(&DeviceId::new("dev-1")));
    }

    // ==================== Refresh Tests ====================

    #[tokio::test]
    async fn test_refresh_renews_tracked_devices_only() {
        let (backend, updater) = status_updater(StatusValidity::FixedTtl(Duration::from_secs(30)));
        updater
            .update_online(&auth("dev-1", None), Utc::now())
            .await
            .unwrap();
        updater
            .update_online(&auth("dev-2", None), Utc::now())
            .await
            .unwrap();
        updater
            .update_offline(&DeviceId::new("dev-2"), "device-token")
            .await
            .unwrap();

        updater.refresh().await;

        let first = reports(&backend, "dev-1");
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(status, _)| *status == ConnectionStatus::Online));
        assert!(first[1].1 >= first[0].1);
        let second: Vec<ConnectionStatus> = reports(&backend, "dev-2")
            .into_iter()
            .map(|(status, _)| status)
            .collect();
        assert_eq!(second, vec![ConnectionStatus::Online, ConnectionStatus::Offline]);
    }

    #[tokio::test]
    async fn test_refresh_task_only_for_fixed_ttl() {
        let (_backend, updater) = status_updater(StatusValidity::TokenExpiry);
        assert!(updater.start_refresh().is_none());

        let (backend, updater) = status_updater(StatusValidity::FixedTtl(Duration::from_millis(200)));
        updater
            .update_online(&auth("dev-1", None), Utc::now())
            .await
            .unwrap();
        let task = updater.start_refresh().unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(reports(&backend, "dev-1").len() >= 3);
        task.abort();
    }
}
