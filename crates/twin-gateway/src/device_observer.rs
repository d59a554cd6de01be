//! Observation of a signed-in device's published resources.
//!
//! Every published resource is observed on the device (or read once when it
//! is not observable) and each notification is forwarded to the backend as
//! a content change, keeping the device twin current.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};
use twin_proto::{DeviceId, Message, ResourceId, ResourceLink, TwinSyncState};

use crate::connection::{DeviceObservation, NotifyFn};
use crate::session::Session;

#[derive(Default)]
struct ObservedResource {
    synchronized: bool,
    observation: Option<Box<dyn DeviceObservation>>,
}

/// Keeps the device twin of one device in sync with the device.
pub struct DeviceObserver {
    device_id: DeviceId,
    session: Weak<Session>,
    resources: Mutex<HashMap<String, ObservedResource>>,
    syncing: AtomicBool,
    closed: AtomicBool,
}

impl DeviceObserver {
    /// Create an observer for the device behind `session`.
    #[must_use]
    pub fn new(session: &Arc<Session>, device_id: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            session: Arc::downgrade(session),
            resources: Mutex::new(HashMap::new()),
            syncing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Observed device.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Hrefs being observed, sorted.
    #[must_use]
    pub fn observed_hrefs(&self) -> Vec<String> {
        let mut hrefs: Vec<String> = self.resources.lock().keys().cloned().collect();
        hrefs.sort();
        hrefs
    }

    /// True when every observed resource delivered its first content.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.resources.lock().values().all(|r| r.synchronized)
    }

    /// Start observing `links`; already observed hrefs are skipped.
    pub fn add_resources(self: &Arc<Self>, links: Vec<ResourceLink>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let added: Vec<ResourceLink> = {
            let mut resources = self.resources.lock();
            links
                .into_iter()
                .filter(|link| {
                    if resources.contains_key(&link.href) {
                        return false;
                    }
                    resources.insert(link.href.clone(), ObservedResource::default());
                    true
                })
                .collect()
        };
        if added.is_empty() {
            return;
        }
        let start_sync = !self.syncing.swap(true, Ordering::AcqRel);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if start_sync {
                if let Some(session) = this.session.upgrade() {
                    session.report_twin_sync(TwinSyncState::Syncing).await;
                }
            }
            join_all(added.into_iter().map(|link| this.establish(link))).await;
        });
    }

    async fn establish(self: &Arc<Self>, link: ResourceLink) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let href = link.href.clone();
        let result = if link.is_observable() {
            let timeout = session
                .context()
                .map_or(crate::config::DEFAULT_KEEPALIVE_TIMEOUT, |ctx| {
                    ctx.config.keepalive_timeout
                });
            session
                .connection()
                .observe(href.clone(), timeout, self.notify_fn(&href))
                .await
                .map(|(response, observation)| (response, Some(observation)))
        } else {
            session.get(&href).await.map(|response| (response, None))
        };
        let (response, observation) = match result {
            Ok(established) => established,
            Err(e) => {
                warn!(device_id = %self.device_id, %href, error = %e, "cannot observe resource");
                self.resources.lock().remove(&href);
                self.check_synchronized(&session).await;
                return;
            }
        };
        let stale = {
            let mut resources = self.resources.lock();
            match resources.get_mut(&href) {
                Some(entry) if !self.closed.load(Ordering::Acquire) => {
                    entry.observation = observation;
                    None
                }
                _ => observation,
            }
        };
        if let Some(stale) = stale {
            cancel(stale).await;
            return;
        }
        debug!(device_id = %self.device_id, %href, "resource observed");
        self.on_notification(&session, &href, response).await;
    }

    fn notify_fn(self: &Arc<Self>, href: &str) -> NotifyFn {
        let weak = Arc::downgrade(self);
        let href = href.to_string();
        Arc::new(move |message: Message| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let Some(session) = this.session.upgrade() else {
                return;
            };
            let Ok(ctx) = session.context() else {
                return;
            };
            let key = ResourceId::new(this.device_id.clone(), &href);
            let href = href.clone();
            let task_session = Arc::clone(&session);
            let submitted = ctx.notifications.submit(&key, async move {
                this.on_notification(&task_session, &href, message).await;
            });
            if let Err(e) = submitted {
                warn!(device_id = %key.device_id, href = %key.href, error = %e, "cannot process notification");
                session.close();
            }
        })
    }

    async fn on_notification(&self, session: &Arc<Session>, href: &str, message: Message) {
        if let Err(e) = session.notify_resource_changed(href, message).await {
            warn!(device_id = %self.device_id, %href, error = %e, "cannot update device twin");
            session.close();
            return;
        }
        if let Some(entry) = self.resources.lock().get_mut(href) {
            entry.synchronized = true;
        }
        self.check_synchronized(session).await;
    }

    async fn check_synchronized(&self, session: &Session) {
        if self.is_synchronized() && self.syncing.swap(false, Ordering::AcqRel) {
            session.report_twin_sync(TwinSyncState::InSync).await;
        }
    }

    /// Stop observing `hrefs`.
    pub fn remove_resources(&self, hrefs: &[String]) {
        let removed: Vec<_> = {
            let mut resources = self.resources.lock();
            hrefs
                .iter()
                .filter_map(|href| resources.remove(href))
                .filter_map(|r| r.observation)
                .collect()
        };
        cancel_in_background(removed);
    }

    /// Stop every observation without waiting for the device.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let removed: Vec<_> = self
            .resources
            .lock()
            .drain()
            .filter_map(|(_, r)| r.observation)
            .collect();
        cancel_in_background(removed);
    }
}

async fn cancel(observation: Box<dyn DeviceObservation>) {
    if let Err(e) = observation.cancel().await {
        debug!(token = %observation.token(), error = %e, "cannot cancel device observation");
    }
}

fn cancel_in_background(observations: Vec<Box<dyn DeviceObservation>>) {
    if observations.is_empty() {
        return;
    }
    tokio::spawn(async move {
        join_all(observations.into_iter().map(cancel)).await;
    });
}

impl std::fmt::Debug for DeviceObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceObserver")
            .field("device_id", &self.device_id)
            .field("resources", &self.observed_hrefs())
            .finish_non_exhaustive()
    }
}
