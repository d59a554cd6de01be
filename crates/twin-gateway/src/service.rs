//! The gateway service: shared registries plus the session lifecycle.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use twin_proto::{Code, Message};

use crate::auth::TokenValidator;
use crate::backend::{
    EventBus, IdentityProvider, IdentityStore, ResourceAggregate, ResourceDirectory,
    ServiceTokenProvider,
};
use crate::config::ServiceConfig;
use crate::connection::DeviceConnection;
use crate::error::GatewayResult;
use crate::expiration::SessionExpirations;
use crate::handlers;
use crate::heartbeat::{start_service_heartbeat, HeartbeatConfig, HeartbeatHandle, Terminator};
use crate::observation::ObservationContainer;
use crate::projection::Projection;
use crate::session::Session;
use crate::session_index::SessionIndex;
use crate::status_updater::DevicesStatusUpdater;
use crate::subscription::ResourceSubscription;
use crate::waiters::CompletionWaiters;
use crate::worker_pool::{BoundedPool, ShardedPool};

/// External collaborators of the gateway.
#[derive(Clone)]
pub struct Backends {
    /// Command submission.
    pub aggregate: Arc<dyn ResourceAggregate>,
    /// Resource read path.
    pub directory: Arc<dyn ResourceDirectory>,
    /// Event subscription.
    pub bus: Arc<dyn EventBus>,
    /// Device ownership.
    pub identity_store: Arc<dyn IdentityStore>,
    /// Identity providers devices enroll with.
    pub providers: Vec<Arc<dyn IdentityProvider>>,
    /// Access token validation.
    pub validator: Arc<dyn TokenValidator>,
    /// Service credential for backend-driven calls.
    pub service_tokens: Arc<dyn ServiceTokenProvider>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("Backends")
            .field("providers", &providers)
            .finish_non_exhaustive()
    }
}

/// State shared by every session of one gateway instance.
pub struct ServiceContext {
    /// Core configuration.
    pub config: ServiceConfig,
    /// External collaborators.
    pub backends: Backends,
    /// Cloud observers by resource and by connection.
    pub observations: ObservationContainer<ResourceSubscription>,
    /// Signed-in sessions by device.
    pub sessions: SessionIndex,
    /// Backend event projection.
    pub projection: Projection,
    /// Request-scoped completion waiters.
    pub waiters: CompletionWaiters,
    /// Device connection status reporting.
    pub status: Arc<DevicesStatusUpdater>,
    /// Token expiry of signed-in sessions.
    pub expiration: SessionExpirations,
    /// Pool running device request handlers.
    pub requests: BoundedPool,
    /// Ordered per-resource processing of device notifications.
    pub notifications: ShardedPool,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("instance_id", &self.config.instance_id)
            .field("sessions", &self.sessions.len())
            .field("projection", &self.projection)
            .finish_non_exhaustive()
    }
}

/// A running gateway instance.
pub struct Service {
    ctx: Arc<ServiceContext>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Create a service. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the configuration is invalid.
    pub fn new(config: ServiceConfig, backends: Backends) -> GatewayResult<Self> {
        config.validate()?;
        let status = Arc::new(DevicesStatusUpdater::new(
            Arc::clone(&backends.aggregate),
            &config,
        ));
        let ctx = Arc::new(ServiceContext {
            observations: ObservationContainer::new(),
            sessions: SessionIndex::new(),
            projection: Projection::new(ShardedPool::new(
                "projection",
                config.workers,
                config.queue_size,
            )),
            waiters: CompletionWaiters::new(),
            status,
            expiration: SessionExpirations::new(),
            requests: BoundedPool::new("requests", config.max_concurrent_requests),
            notifications: ShardedPool::new("notifications", config.workers, config.queue_size),
            config,
            backends,
        });
        info!(instance_id = %ctx.config.instance_id, "gateway service created");
        Ok(Self {
            ctx,
            heartbeat: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Shared state.
    #[must_use]
    pub const fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Start the heartbeat and the background sweepers.
    pub fn start(&self, terminator: Arc<dyn Terminator>) -> HeartbeatHandle {
        let handle = self.start_heartbeat(terminator);
        let mut tasks = self.tasks.lock();
        tasks.push(self.start_expiration_sweeper());
        if let Some(refresh) = self.ctx.status.start_refresh() {
            tasks.push(refresh);
        }
        handle
    }

    /// Start only the service heartbeat.
    pub fn start_heartbeat(&self, terminator: Arc<dyn Terminator>) -> HeartbeatHandle {
        let config = HeartbeatConfig::new(
            self.ctx.config.instance_id.clone(),
            self.ctx.config.heartbeat_ttl,
        );
        let handle = start_service_heartbeat(
            Arc::clone(&self.ctx.backends.aggregate),
            Arc::clone(&self.ctx.backends.service_tokens),
            config,
            terminator,
        );
        *self.heartbeat.lock() = Some(handle.clone());
        handle
    }

    fn start_expiration_sweeper(&self) -> JoinHandle<()> {
        let ctx = Arc::downgrade(&self.ctx);
        let period = self.ctx.config.expiration_sweep_interval;
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(period);
            loop {
                interval_timer.tick().await;
                let Some(ctx) = ctx.upgrade() else {
                    break;
                };
                for (device_id, session) in ctx.expiration.sweep(Utc::now()) {
                    info!(%device_id, "access token expired, closing session");
                    session.close();
                }
            }
        })
    }

    /// Accept a new device connection.
    #[must_use]
    pub fn connect(&self, conn: Arc<dyn DeviceConnection>) -> Arc<Session> {
        let session = Session::new(&self.ctx, conn);
        debug!(remote_addr = %session.remote_addr(), session_id = %session.id(), "device connected");
        session
    }

    /// Queue a device message for processing.
    ///
    /// Called from the connection's read loop; the work itself runs on the
    /// request pool. Handlers may wait for backend completions, so requests
    /// are not serialized behind each other.
    pub fn dispatch(&self, session: &Arc<Session>, message: Message) {
        if message.code == Code::Empty && message.token.is_empty() {
            return;
        }
        let token = message.token.clone();
        let ctx = Arc::clone(&self.ctx);
        let task_session = Arc::clone(session);
        let submitted = self.ctx.requests.submit(async move {
            handlers::handle(&ctx, &task_session, message).await;
        });
        if let Err(e) = submitted {
            warn!(remote_addr = %session.remote_addr(), error = %e, "cannot queue request");
            session.send_error(token, &e);
        }
    }

    /// Process a device message on the calling task.
    pub async fn process(&self, session: &Arc<Session>, message: Message) {
        handlers::handle(&self.ctx, session, message).await;
    }

    /// Handle a closed connection.
    pub async fn disconnect(&self, session: &Arc<Session>) {
        session.on_close().await;
        debug!(remote_addr = %session.remote_addr(), "device disconnected");
    }

    /// Stop background tasks and close every signed-in session.
    pub async fn shutdown(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let sessions = self.ctx.sessions.drain();
        for session in &sessions {
            session.close();
        }
        for session in sessions {
            session.on_close().await;
        }
        info!(instance_id = %self.ctx.config.instance_id, "gateway service stopped");
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}
