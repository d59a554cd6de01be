//! In-memory resource aggregate, directory, event bus and identity store.
//!
//! Commands fold into per-resource event streams exactly like the backend
//! would record them; every recorded event is published on the bus in
//! order. Failures can be injected per command kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use twin_proto::{
    AuditContext, BusEvent, Command, CommandResponse, CorrelationId, DeviceId,
    DeviceMetadataUpdate, EventEnvelope, Operation, PendingCommand, ResourceChanged,
    ResourceCompleted, ResourceEvent, ResourceId, ResourceLink, RpcCode,
};
use uuid::Uuid;

use crate::backend::{
    BoxFuture, EventBus, EventFilter, EventHandler, IdentityStore, ResourceAggregate,
    ResourceDirectory, ResourceFilter, ResourceSnapshot, ServiceTokenProvider, Subscription,
};
use crate::error::{GatewayError, GatewayResult};

/// Attempts to deliver one batch before it is dropped.
const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Pause between redeliveries, multiplied by the attempt number.
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
struct Aggregate {
    version: u64,
    link: Option<ResourceLink>,
    is_published: bool,
    latest: Option<ResourceChanged>,
    pending: Vec<(Operation, EventEnvelope)>,
}

impl Aggregate {
    fn apply(&mut self, envelope: &EventEnvelope) {
        self.version = envelope.version;
        match &envelope.event {
            ResourceEvent::Snapshot {
                resource,
                is_published,
                latest,
            } => {
                self.link.clone_from(resource);
                self.is_published = *is_published;
                self.latest.clone_from(latest);
            }
            ResourceEvent::Published { resource } => {
                self.link = Some(resource.clone());
                self.is_published = true;
            }
            ResourceEvent::Unpublished => self.is_published = false,
            ResourceEvent::Changed(changed) => self.latest = Some(changed.clone()),
            ResourceEvent::UpdatePending(_) => self.pending.push((Operation::Update, envelope.clone())),
            ResourceEvent::RetrievePending(_) => {
                self.pending.push((Operation::Retrieve, envelope.clone()));
            }
            ResourceEvent::CreatePending(_) => self.pending.push((Operation::Create, envelope.clone())),
            ResourceEvent::DeletePending(_) => self.pending.push((Operation::Delete, envelope.clone())),
            ResourceEvent::Updated(c)
            | ResourceEvent::Retrieved(c)
            | ResourceEvent::Created(c)
            | ResourceEvent::Deleted(c) => {
                let correlation_id = c.correlation_id();
                self.pending
                    .retain(|(_, e)| pending_correlation(&e.event) != Some(correlation_id));
            }
        }
    }

    fn pending_of(&self, operation: Operation, correlation_id: &CorrelationId) -> Option<&PendingCommand> {
        self.pending.iter().find_map(|(op, envelope)| match &envelope.event {
            ResourceEvent::UpdatePending(p)
            | ResourceEvent::RetrievePending(p)
            | ResourceEvent::CreatePending(p)
            | ResourceEvent::DeletePending(p)
                if *op == operation && p.correlation_id() == correlation_id =>
            {
                Some(p)
            }
            _ => None,
        })
    }
}

fn pending_correlation(event: &ResourceEvent) -> Option<&CorrelationId> {
    match event {
        ResourceEvent::UpdatePending(p)
        | ResourceEvent::RetrievePending(p)
        | ResourceEvent::CreatePending(p)
        | ResourceEvent::DeletePending(p) => Some(p.correlation_id()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    remaining: u32,
    code: RpcCode,
}

#[derive(Default)]
struct State {
    resources: HashMap<ResourceId, Aggregate>,
    owners: HashMap<DeviceId, String>,
    device_metadata: HashMap<DeviceId, Vec<DeviceMetadataUpdate>>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    commands: Vec<Command>,
    failures: HashMap<&'static str, InjectedFailure>,
}

struct Subscriber {
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

type Subscribers = Arc<Mutex<HashMap<Uuid, Subscriber>>>;

/// Backend held entirely in memory.
pub struct InMemoryBackend {
    state: Mutex<State>,
    subscribers: Subscribers,
    events: mpsc::UnboundedSender<Vec<BusEvent>>,
    service_token: String,
}

impl InMemoryBackend {
    /// Create a backend and start its bus dispatcher. Must be called inside a
    /// tokio runtime.
    #[must_use]
    pub fn new(service_token: impl Into<String>) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(dispatch_loop(rx, Arc::clone(&subscribers)));
        Arc::new(Self {
            state: Mutex::new(State::default()),
            subscribers,
            events,
            service_token: service_token.into(),
        })
    }

    // ---------- inspection and fault injection ----------

    /// Fail the next `times` submissions of command `kind` with `code`.
    pub fn fail_commands(&self, kind: &'static str, times: u32, code: RpcCode) {
        self.state
            .lock()
            .failures
            .insert(kind, InjectedFailure { remaining: times, code });
    }

    /// Every submitted command, in submission order.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Submitted commands of `kind`.
    #[must_use]
    pub fn commands_of(&self, kind: &str) -> Vec<Command> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    /// Metadata updates recorded for `device_id`.
    #[must_use]
    pub fn device_metadata(&self, device_id: &DeviceId) -> Vec<DeviceMetadataUpdate> {
        self.state
            .lock()
            .device_metadata
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Validity granted to the last heartbeat of `service_id`.
    #[must_use]
    pub fn heartbeat_valid_until(&self, service_id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().heartbeats.get(service_id).copied()
    }

    /// Directory view of one resource.
    #[must_use]
    pub fn resource(&self, resource_id: &ResourceId) -> Option<ResourceSnapshot> {
        let state = self.state.lock();
        state
            .resources
            .get(resource_id)
            .map(|aggregate| snapshot(resource_id, aggregate))
    }

    /// Record `owner` as owner of `device_id`.
    pub fn set_owner(&self, device_id: DeviceId, owner: impl Into<String>) {
        self.state.lock().owners.insert(device_id, owner.into());
    }

    /// Append `event` to the stream of `resource_id` and publish it.
    ///
    /// Returns the recorded envelope.
    pub fn emit(&self, resource_id: &ResourceId, event: ResourceEvent) -> EventEnvelope {
        let mut state = self.state.lock();
        let envelope = record(&mut state, resource_id, event);
        self.publish(vec![BusEvent::Resource(envelope.clone())]);
        envelope
    }

    /// Publish `events` without recording them, e.g. to simulate redelivery.
    pub fn publish(&self, events: Vec<BusEvent>) {
        if events.is_empty() {
            return;
        }
        if self.events.send(events).is_err() {
            warn!("event bus dispatcher stopped");
        }
    }

    // ---------- command folding ----------

    fn take_failure(state: &mut State, kind: &'static str) -> Option<GatewayError> {
        let failure = state.failures.get_mut(kind)?;
        if failure.remaining == 0 {
            return None;
        }
        failure.remaining -= 1;
        Some(GatewayError::backend(
            failure.code,
            format!("injected failure of {kind}"),
        ))
    }

    fn execute(&self, token: &str, command: Command) -> GatewayResult<CommandResponse> {
        if token.is_empty() {
            return Err(GatewayError::backend(RpcCode::Unauthenticated, "missing token"));
        }
        let mut state = self.state.lock();
        state.commands.push(command.clone());
        if let Some(err) = Self::take_failure(&mut state, command.kind()) {
            return Err(err);
        }
        command
            .validate()
            .map_err(|e| GatewayError::backend(RpcCode::InvalidArgument, e.to_string()))?;

        let mut response = CommandResponse::default();
        let mut bus = Vec::new();
        match command {
            Command::PublishResourceLinks { links, .. } => {
                for link in links {
                    let resource_id = link.resource_id();
                    let current = state.resources.get(&resource_id);
                    if current.is_some_and(|a| a.is_published && a.link.as_ref() == Some(&link)) {
                        continue;
                    }
                    response.events.push(record(
                        &mut state,
                        &resource_id,
                        ResourceEvent::Published { resource: link },
                    ));
                }
            }
            Command::UnpublishResourceLinks {
                device_id,
                hrefs,
                instance_ids,
            } => {
                let all = hrefs.is_empty() && instance_ids.is_empty();
                let mut targets: Vec<ResourceId> = state
                    .resources
                    .iter()
                    .filter(|(id, a)| {
                        id.device_id == device_id
                            && a.is_published
                            && (all
                                || hrefs.iter().any(|h| twin_proto::normalize_href(h) == id.href)
                                || a.link
                                    .as_ref()
                                    .is_some_and(|l| instance_ids.contains(&l.instance_id)))
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                targets.sort();
                for resource_id in targets {
                    response
                        .events
                        .push(record(&mut state, &resource_id, ResourceEvent::Unpublished));
                }
            }
            Command::NotifyResourceChanged {
                resource_id,
                content,
                status,
            } => {
                response.events.push(record(
                    &mut state,
                    &resource_id,
                    ResourceEvent::Changed(ResourceChanged { content, status }),
                ));
            }
            Command::UpdateResource {
                resource_id,
                correlation_id,
                content,
                interface,
            } => {
                let pending = pending_command(&state, &resource_id, correlation_id, Some(content), interface)?;
                response
                    .events
                    .push(record(&mut state, &resource_id, ResourceEvent::UpdatePending(pending)));
            }
            Command::RetrieveResource {
                resource_id,
                correlation_id,
                interface,
            } => {
                let pending = pending_command(&state, &resource_id, correlation_id, None, interface)?;
                response.events.push(record(
                    &mut state,
                    &resource_id,
                    ResourceEvent::RetrievePending(pending),
                ));
            }
            Command::CreateResource {
                resource_id,
                correlation_id,
                content,
            } => {
                let pending = pending_command(&state, &resource_id, correlation_id, Some(content), None)?;
                response
                    .events
                    .push(record(&mut state, &resource_id, ResourceEvent::CreatePending(pending)));
            }
            Command::DeleteResource {
                resource_id,
                correlation_id,
            } => {
                let pending = pending_command(&state, &resource_id, correlation_id, None, None)?;
                response
                    .events
                    .push(record(&mut state, &resource_id, ResourceEvent::DeletePending(pending)));
            }
            Command::ConfirmResource {
                operation,
                resource_id,
                correlation_id,
                status,
                content,
            } => {
                let audit = state
                    .resources
                    .get(&resource_id)
                    .and_then(|a| a.pending_of(operation, &correlation_id))
                    .map(|p| p.audit.clone())
                    .ok_or_else(|| {
                        GatewayError::backend(
                            RpcCode::NotFound,
                            format!("no pending {operation} {correlation_id} on {resource_id}"),
                        )
                    })?;
                let completed = ResourceCompleted {
                    resource_id: resource_id.clone(),
                    audit,
                    status,
                    content,
                };
                let event = match operation {
                    Operation::Update => ResourceEvent::Updated(completed),
                    Operation::Retrieve => ResourceEvent::Retrieved(completed),
                    Operation::Create => ResourceEvent::Created(completed),
                    Operation::Delete => ResourceEvent::Deleted(completed),
                };
                response.events.push(record(&mut state, &resource_id, event));
            }
            Command::UpdateDeviceMetadata { device_id, update } => {
                if let DeviceMetadataUpdate::Connection { valid_until, .. } = &update {
                    response.valid_until = *valid_until;
                }
                state.device_metadata.entry(device_id).or_default().push(update);
            }
            Command::UpdateServiceMetadata { heartbeat } => {
                let ttl = chrono::Duration::from_std(heartbeat.time_to_live)
                    .map_err(|e| GatewayError::backend(RpcCode::InvalidArgument, e.to_string()))?;
                let valid_until = Utc::now() + ttl;
                state.heartbeats.insert(heartbeat.service_id, valid_until);
                response.valid_until = Some(valid_until);
            }
            Command::DeleteDevices { device_ids } => {
                state
                    .resources
                    .retain(|id, _| !device_ids.contains(&id.device_id));
                for device_id in device_ids {
                    state.device_metadata.remove(&device_id);
                    bus.push(BusEvent::DeviceUnregistered { device_id });
                }
            }
        }

        let mut events: Vec<BusEvent> = response
            .events
            .iter()
            .cloned()
            .map(BusEvent::Resource)
            .collect();
        events.append(&mut bus);
        // Published under the state lock so bus order matches version order.
        self.publish(events);
        drop(state);
        Ok(response)
    }
}

fn pending_command(
    state: &State,
    resource_id: &ResourceId,
    correlation_id: CorrelationId,
    content: Option<twin_proto::Content>,
    interface: Option<String>,
) -> GatewayResult<PendingCommand> {
    if !state.resources.contains_key(resource_id) {
        return Err(GatewayError::backend(
            RpcCode::NotFound,
            format!("cannot find resource '{resource_id}'"),
        ));
    }
    let user_id = state
        .owners
        .get(&resource_id.device_id)
        .cloned()
        .unwrap_or_default();
    Ok(PendingCommand {
        resource_id: resource_id.clone(),
        audit: AuditContext::new(user_id, correlation_id),
        content,
        interface,
    })
}

fn record(state: &mut State, resource_id: &ResourceId, event: ResourceEvent) -> EventEnvelope {
    let aggregate = state.resources.entry(resource_id.clone()).or_default();
    let envelope = EventEnvelope::new(resource_id.clone(), aggregate.version + 1, event);
    aggregate.apply(&envelope);
    envelope
}

fn snapshot(resource_id: &ResourceId, aggregate: &Aggregate) -> ResourceSnapshot {
    ResourceSnapshot {
        resource: aggregate
            .link
            .clone()
            .unwrap_or_else(|| ResourceLink::new(resource_id.device_id.clone(), &resource_id.href)),
        is_published: aggregate.is_published,
        latest: aggregate.latest.clone(),
        version: aggregate.version,
        pending: aggregate.pending.iter().map(|(_, e)| e.clone()).collect(),
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Vec<BusEvent>>, subscribers: Subscribers) {
    while let Some(batch) = rx.recv().await {
        let targets: Vec<(Uuid, Arc<dyn EventHandler>, Vec<BusEvent>)> = subscribers
            .lock()
            .iter()
            .filter_map(|(id, s)| {
                let events: Vec<BusEvent> =
                    batch.iter().filter(|e| s.filter.matches(e)).cloned().collect();
                (!events.is_empty()).then(|| (*id, Arc::clone(&s.handler), events))
            })
            .collect();
        for (id, handler, events) in targets {
            deliver(id, handler.as_ref(), events).await;
        }
    }
    debug!("event bus dispatcher stopped");
}

async fn deliver(id: Uuid, handler: &dyn EventHandler, events: Vec<BusEvent>) {
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match handler.handle(events.clone()).await {
            Ok(()) => return,
            Err(e) => {
                warn!(subscription = %id, attempt, error = %e, "event delivery failed");
                tokio::time::sleep(REDELIVERY_BACKOFF * attempt).await;
            }
        }
    }
    warn!(subscription = %id, count = events.len(), "dropping undeliverable events");
}

impl ResourceAggregate for InMemoryBackend {
    fn submit<'a>(
        &'a self,
        token: &'a str,
        command: Command,
    ) -> BoxFuture<'a, GatewayResult<CommandResponse>> {
        Box::pin(async move { self.execute(token, command) })
    }
}

impl ResourceDirectory for InMemoryBackend {
    fn get_resources<'a>(
        &'a self,
        token: &'a str,
        filter: &'a ResourceFilter,
    ) -> BoxFuture<'a, GatewayResult<Vec<ResourceSnapshot>>> {
        Box::pin(async move {
            if token.is_empty() {
                return Err(GatewayError::backend(RpcCode::Unauthenticated, "missing token"));
            }
            let state = self.state.lock();
            let mut snapshots: Vec<ResourceSnapshot> = state
                .resources
                .iter()
                .filter(|(id, _)| filter.matches(id))
                .map(|(id, aggregate)| snapshot(id, aggregate))
                .collect();
            snapshots.sort_by(|a, b| a.resource.href.cmp(&b.resource.href));
            Ok(snapshots)
        })
    }
}

impl EventBus for InMemoryBackend {
    fn subscribe(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> GatewayResult<Subscription> {
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .insert(id, Subscriber { filter, handler });
        let subscribers = Arc::downgrade(&self.subscribers);
        Ok(Subscription::new(id, move |id| {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.lock().remove(&id);
            }
        }))
    }
}

impl IdentityStore for InMemoryBackend {
    fn add_device<'a>(
        &'a self,
        owner: &'a str,
        device_id: &'a DeviceId,
    ) -> BoxFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            match state.owners.get(device_id) {
                Some(current) if current != owner => Err(GatewayError::backend(
                    RpcCode::PermissionDenied,
                    format!("device '{device_id}' belongs to another owner"),
                )),
                _ => {
                    state.owners.insert(device_id.clone(), owner.to_string());
                    Ok(())
                }
            }
        })
    }

    fn delete_devices<'a>(
        &'a self,
        owner: &'a str,
        device_ids: &'a [DeviceId],
    ) -> BoxFuture<'a, GatewayResult<Vec<DeviceId>>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let removed: Vec<DeviceId> = device_ids
                .iter()
                .filter(|id| state.owners.get(*id).is_some_and(|o| o == owner))
                .cloned()
                .collect();
            for id in &removed {
                state.owners.remove(id);
            }
            Ok(removed)
        })
    }

    fn is_owner<'a>(
        &'a self,
        owner: &'a str,
        device_id: &'a DeviceId,
    ) -> BoxFuture<'a, GatewayResult<bool>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .owners
                .get(device_id)
                .is_some_and(|o| o == owner))
        })
    }
}

impl ServiceTokenProvider for InMemoryBackend {
    fn service_token(&self) -> BoxFuture<'_, GatewayResult<String>> {
        Box::pin(async move { Ok(self.service_token.clone()) })
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBackend")
            .field("resources", &state.resources.len())
            .field("devices", &state.owners.len())
            .field("subscribers", &self.subscribers.lock().len())
            .finish_non_exhaustive()
    }
}
