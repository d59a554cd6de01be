//! Projection of the backend event stream onto connected devices.
//!
//! Events are folded per resource under that resource's lock, in delivery
//! order. Folding is pure; the side effects (device observation, fan-out to
//! cloud observers, completion delivery, relay of pending commands) run
//! afterwards while the same lock is still held, so relays for one resource
//! never overlap or reorder.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, trace, warn};
use twin_proto::{
    BusEvent, Code, CorrelationId, DeviceId, EventEnvelope, Operation, PendingCommand,
    ResourceChanged, ResourceCompleted, ResourceEvent, ResourceId, ResourceLink,
};

use crate::backend::{
    BoxFuture, EventFilter, EventHandler, ResourceFilter, ResourceSnapshot, Subscription,
};
use crate::error::{GatewayError, GatewayResult};
use crate::service::ServiceContext;
use crate::session::Session;
use crate::worker_pool::ShardedPool;

/// Order in which pending queues are drained.
pub const DRAIN_ORDER: [Operation; 4] = [
    Operation::Update,
    Operation::Retrieve,
    Operation::Create,
    Operation::Delete,
];

#[derive(Debug, Default, Clone)]
struct PendingQueues {
    update: VecDeque<PendingCommand>,
    retrieve: VecDeque<PendingCommand>,
    create: VecDeque<PendingCommand>,
    delete: VecDeque<PendingCommand>,
}

impl PendingQueues {
    const fn queue(&self, operation: Operation) -> &VecDeque<PendingCommand> {
        match operation {
            Operation::Update => &self.update,
            Operation::Retrieve => &self.retrieve,
            Operation::Create => &self.create,
            Operation::Delete => &self.delete,
        }
    }

    const fn queue_mut(&mut self, operation: Operation) -> &mut VecDeque<PendingCommand> {
        match operation {
            Operation::Update => &mut self.update,
            Operation::Retrieve => &mut self.retrieve,
            Operation::Create => &mut self.create,
            Operation::Delete => &mut self.delete,
        }
    }

    fn push(&mut self, operation: Operation, pending: PendingCommand) {
        let queue = self.queue_mut(operation);
        if queue
            .iter()
            .any(|p| p.correlation_id() == pending.correlation_id())
        {
            return;
        }
        queue.push_back(pending);
    }

    fn remove(&mut self, operation: Operation, correlation_id: &CorrelationId) -> bool {
        let queue = self.queue_mut(operation);
        let before = queue.len();
        queue.retain(|p| p.correlation_id() != correlation_id);
        queue.len() != before
    }

    fn is_empty(&self) -> bool {
        DRAIN_ORDER.iter().all(|op| self.queue(*op).is_empty())
    }
}

/// What a fold changed, for the effects that follow it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FoldOutcome {
    /// The resource became published.
    pub published: bool,
    /// The resource became unpublished.
    pub unpublished: bool,
    /// An explicit unpublish event was applied.
    pub withdrawn: bool,
    /// The latest content was replaced.
    pub changed: bool,
    /// Completions to hand to request-scoped waiters.
    pub completions: Vec<(Operation, ResourceCompleted)>,
    /// Number of envelopes applied; the rest were already seen.
    pub applied: usize,
    /// A version was missing before an event; the rest of the batch was not
    /// applied and the resource must be reloaded from the directory.
    pub gap: bool,
}

impl FoldOutcome {
    /// Merge the outcome of a later fold into this one.
    pub fn absorb(&mut self, later: Self) {
        if later.published {
            self.published = true;
            self.unpublished = false;
        }
        if later.unpublished {
            self.unpublished = true;
            self.published = false;
        }
        self.withdrawn |= later.withdrawn;
        self.changed |= later.changed;
        self.completions.extend(later.completions);
        self.applied += later.applied;
        self.gap = later.gap;
    }
}

/// Folded state of one resource.
#[derive(Debug, Clone)]
pub struct ResourceCtx {
    resource_id: ResourceId,
    resource: Option<ResourceLink>,
    is_published: bool,
    latest: Option<ResourceChanged>,
    version: Option<u64>,
    pending: PendingQueues,
}

impl ResourceCtx {
    /// Empty state for `resource_id`.
    #[must_use]
    pub fn new(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            resource: None,
            is_published: false,
            latest: None,
            version: None,
            pending: PendingQueues::default(),
        }
    }

    /// Resource this state belongs to.
    #[must_use]
    pub const fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Publication flag.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        self.is_published
    }

    /// Latest content.
    #[must_use]
    pub const fn latest(&self) -> Option<&ResourceChanged> {
        self.latest.as_ref()
    }

    /// Version of the last applied envelope.
    #[must_use]
    pub const fn version(&self) -> Option<u64> {
        self.version
    }

    /// Link of the resource; synthesized from the ID until one is published.
    #[must_use]
    pub fn link(&self) -> ResourceLink {
        self.resource.clone().unwrap_or_else(|| {
            ResourceLink::new(self.resource_id.device_id.clone(), &self.resource_id.href)
        })
    }

    /// Correlation IDs waiting in the `operation` queue, oldest first.
    #[must_use]
    pub fn pending(&self, operation: Operation) -> Vec<CorrelationId> {
        self.pending
            .queue(operation)
            .iter()
            .map(|p| p.correlation_id().clone())
            .collect()
    }

    /// True when nothing waits to be relayed.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply `events` in order, skipping versions already applied.
    ///
    /// A snapshot replaces the state unless it is older than the applied
    /// version. Any other event must directly follow the applied version
    /// (version 1 on empty state); otherwise folding stops and the outcome
    /// asks for a reload.
    pub fn fold(&mut self, events: &[EventEnvelope]) -> FoldOutcome {
        let mut outcome = FoldOutcome::default();
        for envelope in events {
            let is_snapshot = matches!(envelope.event, ResourceEvent::Snapshot { .. });
            if self
                .version
                .is_some_and(|v| envelope.version < v || (envelope.version == v && !is_snapshot))
            {
                trace!(
                    resource_id = %self.resource_id,
                    version = envelope.version,
                    "skipping applied event"
                );
                continue;
            }
            let expected = self.version.map_or(1, |v| v + 1);
            if !is_snapshot && envelope.version > expected {
                debug!(
                    resource_id = %self.resource_id,
                    expected,
                    version = envelope.version,
                    "gap in event stream"
                );
                outcome.gap = true;
                break;
            }
            self.version = Some(envelope.version);
            outcome.applied += 1;
            self.apply(&envelope.event, &mut outcome);
        }
        outcome
    }

    /// Replace the state with a directory snapshot, pending commands included.
    ///
    /// Snapshots older than the applied version are ignored.
    pub fn restore(&mut self, snapshot: &ResourceSnapshot) -> FoldOutcome {
        let mut outcome = FoldOutcome::default();
        if self.version.is_some_and(|v| snapshot.version < v) {
            trace!(
                resource_id = %self.resource_id,
                version = snapshot.version,
                "skipping stale snapshot"
            );
            return outcome;
        }
        self.apply(
            &ResourceEvent::Snapshot {
                resource: Some(snapshot.resource.clone()),
                is_published: snapshot.is_published,
                latest: snapshot.latest.clone(),
            },
            &mut outcome,
        );
        self.pending = PendingQueues::default();
        for envelope in &snapshot.pending {
            self.apply(&envelope.event, &mut outcome);
        }
        self.version = Some(snapshot.version);
        outcome.applied = 1;
        outcome
    }

    fn apply(&mut self, event: &ResourceEvent, outcome: &mut FoldOutcome) {
        match event {
            ResourceEvent::Snapshot {
                resource,
                is_published,
                latest,
            } => {
                if !self.is_published {
                    outcome.published = *is_published;
                    outcome.unpublished = !*is_published;
                } else if !*is_published {
                    outcome.published = false;
                    outcome.unpublished = true;
                }
                if resource.is_some() {
                    self.resource.clone_from(resource);
                }
                self.is_published = *is_published;
                self.latest.clone_from(latest);
                outcome.changed = true;
            }
            ResourceEvent::Published { resource } => {
                if !self.is_published {
                    outcome.published = true;
                    outcome.unpublished = false;
                }
                self.is_published = true;
                self.resource = Some(resource.clone());
            }
            ResourceEvent::Unpublished => {
                if self.is_published {
                    outcome.published = false;
                    outcome.unpublished = true;
                }
                self.is_published = false;
                outcome.withdrawn = true;
            }
            ResourceEvent::Changed(changed) => {
                self.latest = Some(changed.clone());
                outcome.changed = true;
            }
            ResourceEvent::UpdatePending(p) => self.pending.push(Operation::Update, p.clone()),
            ResourceEvent::RetrievePending(p) => self.pending.push(Operation::Retrieve, p.clone()),
            ResourceEvent::CreatePending(p) => self.pending.push(Operation::Create, p.clone()),
            ResourceEvent::DeletePending(p) => self.pending.push(Operation::Delete, p.clone()),
            ResourceEvent::Updated(c) => self.complete(Operation::Update, c, outcome),
            ResourceEvent::Retrieved(c) => self.complete(Operation::Retrieve, c, outcome),
            ResourceEvent::Created(c) => self.complete(Operation::Create, c, outcome),
            ResourceEvent::Deleted(c) => self.complete(Operation::Delete, c, outcome),
        }
    }

    fn complete(
        &mut self,
        operation: Operation,
        completed: &ResourceCompleted,
        outcome: &mut FoldOutcome,
    ) {
        self.pending.remove(operation, completed.correlation_id());
        outcome.completions.push((operation, completed.clone()));
    }
}

/// Run the effects of a fold while the resource lock is held.
async fn apply_effects(ctx: &Arc<ServiceContext>, rctx: &mut ResourceCtx, outcome: FoldOutcome) {
    let session = ctx.sessions.find(&rctx.resource_id.device_id);

    if outcome.published {
        if let Some(ref session) = session {
            session.observe_published(vec![rctx.link()]);
        }
    } else if outcome.unpublished {
        if let Some(ref session) = session {
            session.unobserve_published(&[rctx.resource_id.href.clone()]);
        }
    }
    if outcome.withdrawn {
        for observer in ctx.observations.find(&rctx.resource_id) {
            observer.cancel(Code::ServiceUnavailable);
        }
    }

    if outcome.changed && rctx.is_published {
        if let (Some(version), Some(latest)) = (rctx.version, rctx.latest.as_ref()) {
            for observer in ctx.observations.find(&rctx.resource_id) {
                observer.notify(version, latest);
            }
        }
    }

    for (operation, completed) in outcome.completions {
        ctx.waiters.complete(operation, completed);
    }

    if let Some(session) = session {
        drain(ctx, rctx, &session).await;
    }
}

/// Relay pending commands to the device, oldest first.
///
/// A queue stops at its first failed relay; the rest waits for the next batch.
async fn drain(ctx: &ServiceContext, rctx: &mut ResourceCtx, session: &Session) {
    if rctx.pending.is_empty() {
        return;
    }
    let token = match ctx.backends.service_tokens.service_token().await {
        Ok(token) => token,
        Err(e) => {
            error!(resource_id = %rctx.resource_id, error = %e, "cannot get service token");
            return;
        }
    };
    for operation in DRAIN_ORDER {
        while let Some(pending) = rctx.pending.queue(operation).front().cloned() {
            if let Err(e) = session.relay(operation, &pending, &token).await {
                warn!(
                    resource_id = %rctx.resource_id,
                    correlation_id = %pending.correlation_id(),
                    %operation,
                    error = %e,
                    "relay failed"
                );
                break;
            }
            rctx.pending.remove(operation, pending.correlation_id());
        }
    }
}

struct Registration {
    count: usize,
    _subscription: Subscription,
}

/// Projection of every resource of the devices some component is interested in.
///
/// Devices are reference counted: the first registration subscribes to the
/// device's events and loads its current state, the last one drops both.
pub struct Projection {
    resources: Mutex<HashMap<ResourceId, Arc<AsyncMutex<ResourceCtx>>>>,
    registrations: Mutex<HashMap<DeviceId, Registration>>,
    pool: ShardedPool,
}

impl Projection {
    /// Create a projection folding on `pool`.
    #[must_use]
    pub fn new(pool: ShardedPool) -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            pool,
        }
    }

    /// Number of registrations held for `device_id`.
    #[must_use]
    pub fn registrations(&self, device_id: &DeviceId) -> usize {
        self.registrations
            .lock()
            .get(device_id)
            .map_or(0, |r| r.count)
    }

    /// Register interest in `device_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscription or the initial load fails;
    /// the registration is released in that case.
    pub async fn register(&self, ctx: &Arc<ServiceContext>, device_id: &DeviceId) -> GatewayResult<()> {
        {
            let mut registrations = self.registrations.lock();
            if let Some(registration) = registrations.get_mut(device_id) {
                registration.count += 1;
                return Ok(());
            }
            let handler = Arc::new(ProjectionHandler {
                ctx: Arc::downgrade(ctx),
            });
            let subscription = ctx
                .backends
                .bus
                .subscribe(EventFilter::device(device_id.clone()), handler)?;
            registrations.insert(
                device_id.clone(),
                Registration {
                    count: 1,
                    _subscription: subscription,
                },
            );
        }
        debug!(%device_id, "projection registered");
        if let Err(e) = self.load(ctx, device_id).await {
            self.unregister(device_id);
            return Err(e);
        }
        Ok(())
    }

    /// Load the directory state of `device_id` into the projection.
    async fn load(&self, ctx: &Arc<ServiceContext>, device_id: &DeviceId) -> GatewayResult<()> {
        let token = ctx.backends.service_tokens.service_token().await?;
        let filter = ResourceFilter::device(device_id.clone());
        let snapshots = match ctx.backends.directory.get_resources(&token, &filter).await {
            Ok(snapshots) => snapshots,
            Err(GatewayError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        for snapshot in snapshots {
            let resource_id = ResourceId::new(device_id.clone(), &snapshot.resource.href);
            let task_ctx = Arc::clone(ctx);
            let key = resource_id.clone();
            self.pool.submit(&key, async move {
                let rctx = task_ctx.projection.resource(&resource_id);
                let mut guard = rctx.lock().await;
                let outcome = guard.restore(&snapshot);
                if outcome.applied == 0 {
                    return;
                }
                apply_effects(&task_ctx, &mut guard, outcome).await;
            })?;
        }
        Ok(())
    }

    /// Current directory state of one resource.
    async fn reload(ctx: &ServiceContext, resource_id: &ResourceId) -> GatewayResult<Option<ResourceSnapshot>> {
        let token = ctx.backends.service_tokens.service_token().await?;
        let filter = ResourceFilter::resource(resource_id.clone());
        let snapshots = match ctx.backends.directory.get_resources(&token, &filter).await {
            Ok(snapshots) => snapshots,
            Err(GatewayError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(snapshots
            .into_iter()
            .find(|s| s.resource.resource_id() == *resource_id))
    }

    /// Release one registration of `device_id`.
    pub fn unregister(&self, device_id: &DeviceId) {
        let mut registrations = self.registrations.lock();
        let Some(registration) = registrations.get_mut(device_id) else {
            return;
        };
        registration.count -= 1;
        if registration.count > 0 {
            return;
        }
        registrations.remove(device_id);
        drop(registrations);
        self.resources
            .lock()
            .retain(|id, _| &id.device_id != device_id);
        debug!(%device_id, "projection released");
    }

    fn resource(&self, resource_id: &ResourceId) -> Arc<AsyncMutex<ResourceCtx>> {
        Arc::clone(
            self.resources
                .lock()
                .entry(resource_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(ResourceCtx::new(resource_id.clone())))),
        )
    }

    /// Snapshot of the folded state of `resource_id`, if projected.
    pub async fn state(&self, resource_id: &ResourceId) -> Option<ResourceCtx> {
        let rctx = self.resources.lock().get(resource_id).cloned()?;
        let guard = rctx.lock().await;
        Some(guard.clone())
    }

    /// Fold `events` of `resource_id` and run their effects.
    pub async fn handle(ctx: &Arc<ServiceContext>, resource_id: &ResourceId, events: &[EventEnvelope]) {
        let rctx = ctx.projection.resource(resource_id);
        let mut guard = rctx.lock().await;
        let mut outcome = guard.fold(events);
        if outcome.gap {
            match Self::reload(ctx, resource_id).await {
                Ok(Some(snapshot)) => {
                    outcome.absorb(guard.restore(&snapshot));
                    outcome.absorb(guard.fold(events));
                    if outcome.gap {
                        warn!(%resource_id, version = ?guard.version, "events newer than the directory were dropped");
                    }
                }
                Ok(None) => debug!(%resource_id, "resource missing from directory"),
                Err(e) => warn!(%resource_id, error = %e, "cannot reload resource"),
            }
        }
        if outcome.applied == 0 {
            return;
        }
        apply_effects(ctx, &mut guard, outcome).await;
    }

    /// Queue `events` of `resource_id` on the worker owning that resource.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` if the worker's queue is full.
    pub fn dispatch(
        &self,
        ctx: &Arc<ServiceContext>,
        resource_id: ResourceId,
        events: Vec<EventEnvelope>,
    ) -> GatewayResult<()> {
        let task_ctx = Arc::clone(ctx);
        let key = resource_id.clone();
        self.pool.submit(&key, async move {
            Self::handle(&task_ctx, &resource_id, &events).await;
        })
    }

    /// Replay published resources of a freshly signed-in device.
    ///
    /// Each published resource is observed again and its pending commands
    /// are relayed.
    pub fn trigger_sign_in(&self, ctx: &Arc<ServiceContext>, device_id: &DeviceId) {
        let targets: Vec<_> = self
            .resources
            .lock()
            .iter()
            .filter(|(id, _)| &id.device_id == device_id)
            .map(|(id, rctx)| (id.clone(), Arc::clone(rctx)))
            .collect();
        for (resource_id, rctx) in targets {
            let task_ctx = Arc::clone(ctx);
            let submitted = self.pool.submit(&resource_id, async move {
                let mut guard = rctx.lock().await;
                if !guard.is_published {
                    return;
                }
                let Some(session) = task_ctx.sessions.find(&guard.resource_id.device_id) else {
                    return;
                };
                session.observe_published(vec![guard.link()]);
                drain(&task_ctx, &mut guard, &session).await;
            });
            if let Err(e) = submitted {
                warn!(%resource_id, error = %e, "cannot replay sign-in");
            }
        }
    }
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("resources", &self.resources.lock().len())
            .field("devices", &self.registrations.lock().len())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Keeps a device registered in the projection for its lifetime.
pub struct ProjectionGuard {
    ctx: Weak<ServiceContext>,
    device_id: DeviceId,
}

impl ProjectionGuard {
    /// Register `device_id` and return a guard releasing it on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the registration fails.
    pub async fn acquire(ctx: &Arc<ServiceContext>, device_id: DeviceId) -> GatewayResult<Self> {
        ctx.projection.register(ctx, &device_id).await?;
        Ok(Self {
            ctx: Arc::downgrade(ctx),
            device_id,
        })
    }
}

impl Drop for ProjectionGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.projection.unregister(&self.device_id);
        }
    }
}

/// Bus handler feeding one device's events into the projection.
struct ProjectionHandler {
    ctx: Weak<ServiceContext>,
}

impl EventHandler for ProjectionHandler {
    fn handle(&self, events: Vec<BusEvent>) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            let Some(ctx) = self.ctx.upgrade() else {
                return Ok(());
            };
            let mut batches: Vec<(ResourceId, Vec<EventEnvelope>)> = Vec::new();
            for event in events {
                match event {
                    BusEvent::Resource(envelope) => {
                        match batches.iter_mut().find(|(id, _)| *id == envelope.resource_id) {
                            Some((_, batch)) => batch.push(envelope),
                            None => batches.push((envelope.resource_id.clone(), vec![envelope])),
                        }
                    }
                    BusEvent::DeviceUnregistered { device_id } => {
                        debug!(%device_id, "device unregistered");
                        for observer in ctx.observations.find_by_device(&device_id) {
                            observer.cancel(Code::ServiceUnavailable);
                        }
                    }
                }
            }
            for (resource_id, batch) in batches {
                ctx.projection.dispatch(&ctx, resource_id, batch)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twin_proto::{AuditContext, Content, MediaType, Status};

    fn id() -> ResourceId {
        ResourceId::new(DeviceId::new("dev"), "/light/1")
    }

    fn env(version: u64, event: ResourceEvent) -> EventEnvelope {
        EventEnvelope::new(id(), version, event)
    }

    fn published(version: u64) -> EventEnvelope {
        env(
            version,
            ResourceEvent::Published {
                resource: ResourceLink::new(DeviceId::new("dev"), "/light/1").observable(),
            },
        )
    }

    fn changed(version: u64, body: &str) -> EventEnvelope {
        env(
            version,
            ResourceEvent::Changed(ResourceChanged {
                content: Content::new(MediaType::AppJson, body.as_bytes()),
                status: Status::Ok,
            }),
        )
    }

    fn pending(cid: &str) -> PendingCommand {
        PendingCommand {
            resource_id: id(),
            audit: AuditContext::new("user", CorrelationId::new(cid)),
            content: Some(Content::new(MediaType::AppJson, b"{}".to_vec())),
            interface: None,
        }
    }

    fn completed(cid: &str) -> ResourceCompleted {
        ResourceCompleted {
            resource_id: id(),
            audit: AuditContext::new("user", CorrelationId::new(cid)),
            status: Status::Ok,
            content: Content::empty(),
        }
    }

    // ==================== Publish Transition Tests ====================

    #[test]
    fn test_published_transition_once() {
        let mut rctx = ResourceCtx::new(id());
        let first = rctx.fold(&[published(1)]);
        assert!(first.published);
        assert!(rctx.is_published());

        let second = rctx.fold(&[published(2)]);
        assert!(!second.published);
    }

    #[test]
    fn test_unpublished_transition_only_from_published() {
        let mut rctx = ResourceCtx::new(id());
        let outcome = rctx.fold(&[env(1, ResourceEvent::Unpublished)]);
        assert!(!outcome.unpublished);
        assert!(outcome.withdrawn);

        rctx.fold(&[published(2)]);
        let outcome = rctx.fold(&[env(3, ResourceEvent::Unpublished)]);
        assert!(outcome.unpublished);
        assert!(!rctx.is_published());
    }

    #[test]
    fn test_first_snapshot_emits_transition() {
        let mut rctx = ResourceCtx::new(id());
        let outcome = rctx.fold(&[env(
            5,
            ResourceEvent::Snapshot {
                resource: None,
                is_published: false,
                latest: None,
            },
        )]);
        assert!(outcome.unpublished);
        assert!(!outcome.published);
        assert!(outcome.changed);

        let outcome = rctx.fold(&[env(
            6,
            ResourceEvent::Snapshot {
                resource: None,
                is_published: true,
                latest: None,
            },
        )]);
        assert!(outcome.published);
    }

    #[test]
    fn test_snapshot_while_published_emits_nothing() {
        let mut rctx = ResourceCtx::new(id());
        rctx.fold(&[published(1)]);
        let outcome = rctx.fold(&[env(
            2,
            ResourceEvent::Snapshot {
                resource: None,
                is_published: true,
                latest: None,
            },
        )]);
        assert!(!outcome.published);
        assert!(!outcome.unpublished);
    }

    // ==================== Redelivery Tests ====================

    #[test]
    fn test_redelivered_batch_is_skipped() {
        let mut rctx = ResourceCtx::new(id());
        let batch = [published(1), changed(2, "{\"on\":true}")];
        assert_eq!(rctx.fold(&batch).applied, 2);

        let again = rctx.fold(&batch);
        assert_eq!(again.applied, 0);
        assert!(!again.changed);
        assert_eq!(rctx.version(), Some(2));
    }

    #[test]
    fn test_changed_stores_latest() {
        let mut rctx = ResourceCtx::new(id());
        let outcome = rctx.fold(&[changed(1, "{\"on\":false}")]);
        assert!(outcome.changed);
        assert_eq!(rctx.latest().unwrap().content.data, b"{\"on\":false}");
    }

    // ==================== Gap and Snapshot Tests ====================

    fn snapshot(version: u64, is_published: bool, pending: Vec<EventEnvelope>) -> ResourceSnapshot {
        ResourceSnapshot {
            resource: ResourceLink::new(DeviceId::new("dev"), "/light/1").observable(),
            is_published,
            latest: None,
            version,
            pending,
        }
    }

    #[test]
    fn test_first_event_past_version_one_is_a_gap() {
        let mut rctx = ResourceCtx::new(id());
        let outcome = rctx.fold(&[changed(2, "{\"on\":true}")]);
        assert!(outcome.gap);
        assert_eq!(outcome.applied, 0);
        assert_eq!(rctx.version(), None);
        assert!(rctx.latest().is_none());
    }

    #[test]
    fn test_missing_version_stops_the_batch() {
        let mut rctx = ResourceCtx::new(id());
        let outcome = rctx.fold(&[published(1), changed(3, "{}"), changed(4, "{}")]);
        assert!(outcome.gap);
        assert_eq!(outcome.applied, 1);
        assert_eq!(rctx.version(), Some(1));
    }

    #[test]
    fn test_snapshot_at_applied_version_restores_publication() {
        let mut rctx = ResourceCtx::new(id());
        let gap = rctx.fold(&[changed(2, "{\"on\":true}")]);
        assert!(gap.gap);

        let outcome = rctx.restore(&snapshot(2, true, Vec::new()));
        assert!(outcome.published);
        assert!(rctx.is_published());
        assert_eq!(rctx.version(), Some(2));

        // The directory load of the same version lands afterwards.
        let again = rctx.restore(&snapshot(2, true, Vec::new()));
        assert_eq!(again.applied, 1);
        assert!(!again.published);
        assert!(rctx.is_published());
    }

    #[test]
    fn test_snapshot_event_at_applied_version_is_applied() {
        let mut rctx = ResourceCtx::new(id());
        rctx.fold(&[changed(1, "{}"), changed(2, "{}")]);
        let outcome = rctx.fold(&[env(
            2,
            ResourceEvent::Snapshot {
                resource: None,
                is_published: true,
                latest: None,
            },
        )]);
        assert!(outcome.published);
        assert!(rctx.is_published());
    }

    #[test]
    fn test_stale_snapshot_is_ignored() {
        let mut rctx = ResourceCtx::new(id());
        rctx.fold(&[published(1), env(2, ResourceEvent::Unpublished)]);
        let outcome = rctx.restore(&snapshot(1, true, Vec::new()));
        assert_eq!(outcome, FoldOutcome::default());
        assert!(!rctx.is_published());
        assert_eq!(rctx.version(), Some(2));
    }

    #[test]
    fn test_restore_replaces_pending_queues() {
        let mut rctx = ResourceCtx::new(id());
        rctx.fold(&[env(1, ResourceEvent::UpdatePending(pending("old")))]);
        rctx.restore(&snapshot(
            3,
            true,
            vec![env(2, ResourceEvent::UpdatePending(pending("c2")))],
        ));
        assert_eq!(rctx.pending(Operation::Update), vec![CorrelationId::new("c2")]);

        // Events after the snapshot continue the stream.
        let outcome = rctx.fold(&[env(4, ResourceEvent::Updated(completed("c2")))]);
        assert!(!outcome.gap);
        assert!(!rctx.has_pending());
    }

    #[test]
    fn test_snapshot_unpublishing_published_resource() {
        let mut rctx = ResourceCtx::new(id());
        rctx.fold(&[published(1)]);
        let outcome = rctx.restore(&snapshot(4, false, Vec::new()));
        assert!(outcome.unpublished);
        assert!(!rctx.is_published());
    }

    #[test]
    fn test_absorb_keeps_last_transition() {
        let mut outcome = FoldOutcome {
            published: true,
            applied: 1,
            gap: true,
            ..FoldOutcome::default()
        };
        outcome.absorb(FoldOutcome {
            unpublished: true,
            applied: 2,
            ..FoldOutcome::default()
        });
        assert!(outcome.unpublished);
        assert!(!outcome.published);
        assert_eq!(outcome.applied, 3);
        assert!(!outcome.gap);
    }

    // ==================== Pending Queue Tests ====================

    #[test]
    fn test_pending_fifo_with_out_of_order_completion() {
        let mut rctx = ResourceCtx::new(id());
        rctx.fold(&[
            env(1, ResourceEvent::UpdatePending(pending("c1"))),
            env(2, ResourceEvent::UpdatePending(pending("c2"))),
            env(3, ResourceEvent::UpdatePending(pending("c3"))),
        ]);
        let outcome = rctx.fold(&[env(4, ResourceEvent::Updated(completed("c2")))]);

        assert_eq!(outcome.completions.len(), 1);
        assert_eq!(
            rctx.pending(Operation::Update),
            vec![CorrelationId::new("c1"), CorrelationId::new("c3")]
        );
    }

    #[test]
    fn test_pending_deduplicated_by_correlation() {
        let mut rctx = ResourceCtx::new(id());
        rctx.fold(&[
            env(1, ResourceEvent::RetrievePending(pending("c1"))),
            env(2, ResourceEvent::RetrievePending(pending("c1"))),
        ]);
        assert_eq!(rctx.pending(Operation::Retrieve).len(), 1);
    }

    #[test]
    fn test_queues_are_per_operation() {
        let mut rctx = ResourceCtx::new(id());
        rctx.fold(&[
            env(1, ResourceEvent::CreatePending(pending("c1"))),
            env(2, ResourceEvent::DeletePending(pending("c2"))),
        ]);
        assert_eq!(rctx.pending(Operation::Create).len(), 1);
        assert_eq!(rctx.pending(Operation::Delete).len(), 1);
        assert!(rctx.pending(Operation::Update).is_empty());

        rctx.fold(&[env(3, ResourceEvent::Deleted(completed("c2")))]);
        assert!(rctx.pending(Operation::Delete).is_empty());
        assert!(rctx.has_pending());
    }

    #[test]
    fn test_completion_without_pending_still_reported() {
        let mut rctx = ResourceCtx::new(id());
        let outcome = rctx.fold(&[env(1, ResourceEvent::Retrieved(completed("x")))]);
        assert_eq!(outcome.completions[0].0, Operation::Retrieve);
    }

    #[test]
    fn test_link_falls_back_to_id() {
        let rctx = ResourceCtx::new(id());
        let link = rctx.link();
        assert_eq!(link.href, "/light/1");
        assert_eq!(link.device_id, DeviceId::new("dev"));
    }
}
