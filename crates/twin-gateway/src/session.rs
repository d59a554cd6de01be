//! One device connection and everything the gateway tracks for it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use twin_proto::{
    coap_code_to_status, uri, Code, Command, Content, DeviceId, MediaType, Message, Operation,
    PendingCommand, ResourceEvent, ResourceId, ResourceLink, Status, Token, TwinSyncState,
};
use uuid::Uuid;

use crate::auth::AuthorizationContext;
use crate::backend::{IdentityProvider, TokenGrant};
use crate::connection::DeviceConnection;
use crate::device_observer::DeviceObserver;
use crate::error::{GatewayError, GatewayResult};
use crate::service::ServiceContext;
use crate::subscription::ResourceSubscription;
use crate::token_cache::{refresh_with_any, TokenCache};

/// Upper bound on reporting a closed device offline.
pub const OFFLINE_REPORT_TIMEOUT: Duration = Duration::from_secs(2);

/// Token cache tagged with the session cache generation it was filled in.
#[derive(Debug, Default)]
struct GenerationCache {
    generation: u64,
    cache: TokenCache<TokenGrant>,
}

impl GenerationCache {
    /// The cache, emptied first if `generation` moved on since it was filled.
    fn current(&mut self, generation: u64) -> &mut TokenCache<TokenGrant> {
        if self.generation != generation {
            self.cache.clear();
            self.generation = generation;
        }
        &mut self.cache
    }
}

/// Content carried by a device message.
#[must_use]
pub fn content_of(message: &Message) -> Content {
    Content {
        content_type: message
            .content_format
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
        data: message.payload.clone(),
    }
}

/// Device request relaying a pending backend command.
///
/// # Errors
///
/// Returns `BadRequest` if the command content cannot be expressed as a
/// CoAP content format.
pub fn device_request(operation: Operation, pending: &PendingCommand) -> GatewayResult<Message> {
    let href = pending.resource_id.href.clone();
    let mut request = match operation {
        Operation::Update | Operation::Create => Message::request(Code::Post, href),
        Operation::Retrieve => Message::request(Code::Get, href),
        Operation::Delete => Message::request(Code::Delete, href),
    };
    let interface = match operation {
        Operation::Create => Some(uri::CREATE_INTERFACE),
        _ => pending.interface.as_deref(),
    };
    if let Some(interface) = interface.filter(|i| !i.is_empty()) {
        request = request.with_query(format!("if={interface}"));
    }
    if matches!(operation, Operation::Update | Operation::Create) {
        if let Some(ref content) = pending.content {
            if let Some(media_type) = content.media_type()? {
                request = request.with_payload(media_type, content.data.clone());
            }
        }
    }
    Ok(request)
}

/// State of one connected device.
///
/// A session never owns the service; it reaches shared registries through a
/// weak handle that outlives it in practice.
pub struct Session {
    id: Uuid,
    conn: Arc<dyn DeviceConnection>,
    ctx: Weak<ServiceContext>,
    connected_at: DateTime<Utc>,
    auth: Mutex<Option<AuthorizationContext>>,
    registered_device: Mutex<Option<DeviceId>>,
    subscriptions: Mutex<HashMap<Token, Arc<ResourceSubscription>>>,
    device_observer: Mutex<Option<Arc<DeviceObserver>>>,
    cache_generation: AtomicU64,
    exchange_cache: AsyncMutex<GenerationCache>,
    refresh_cache: AsyncMutex<GenerationCache>,
    closed: AtomicBool,
    finished: AtomicBool,
}

impl Session {
    /// Create a session over `conn`.
    #[must_use]
    pub fn new(ctx: &Arc<ServiceContext>, conn: Arc<dyn DeviceConnection>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            conn,
            ctx: Arc::downgrade(ctx),
            connected_at: Utc::now(),
            auth: Mutex::new(None),
            registered_device: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            device_observer: Mutex::new(None),
            cache_generation: AtomicU64::new(0),
            exchange_cache: AsyncMutex::new(GenerationCache::default()),
            refresh_cache: AsyncMutex::new(GenerationCache::default()),
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    /// Session ID.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Remote address of the device.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// When the device connected.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn DeviceConnection> {
        &self.conn
    }

    /// Shared service state.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` once the service is gone.
    pub fn context(&self) -> GatewayResult<Arc<ServiceContext>> {
        self.ctx
            .upgrade()
            .ok_or_else(|| GatewayError::ServiceUnavailable("service is shut down".to_string()))
    }

    pub(crate) fn context_weak(&self) -> Weak<ServiceContext> {
        Weak::clone(&self.ctx)
    }

    fn request_timeout(&self) -> Duration {
        self.ctx
            .upgrade()
            .map_or(crate::config::DEFAULT_KEEPALIVE_TIMEOUT, |ctx| {
                ctx.config.keepalive_timeout
            })
    }

    // ---------- authorization ----------

    /// Current authorization context.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` when none is set or it has expired.
    pub fn authorization_context(&self) -> GatewayResult<AuthorizationContext> {
        let auth = self
            .auth
            .lock()
            .clone()
            .ok_or_else(|| GatewayError::Unauthenticated("cannot find authorization context".to_string()))?;
        auth.validate()?;
        Ok(auth)
    }

    /// Device ID of the stored context, valid or not.
    #[must_use]
    pub fn device_id(&self) -> Option<DeviceId> {
        self.auth.lock().as_ref().map(|a| a.device_id.clone())
    }

    /// Replace the authorization context, returning the previous one.
    pub fn set_authorization_context(
        &self,
        auth: Option<AuthorizationContext>,
    ) -> Option<AuthorizationContext> {
        std::mem::replace(&mut *self.auth.lock(), auth)
    }

    /// Install `auth` and index the session under its device.
    ///
    /// When the device or owner changes, everything tied to the previous
    /// identity is torn down and the previous device is removed from the
    /// index before the new one is added.
    ///
    /// # Errors
    ///
    /// Returns an error if the device's projection cannot be registered.
    pub async fn authorize(
        self: &Arc<Self>,
        auth: AuthorizationContext,
    ) -> GatewayResult<Option<AuthorizationContext>> {
        let ctx = self.context()?;
        let device_id = auth.device_id.clone();
        let user_id = auth.user_id.clone();
        let old = self.set_authorization_context(Some(auth));
        let same_identity = old
            .as_ref()
            .is_some_and(|o| o.device_id == device_id && o.user_id == user_id);
        if same_identity && self.registered_device.lock().is_some() {
            return Ok(old);
        }

        self.cancel_subscriptions();
        self.close_device_observer();
        let previous = self.registered_device.lock().take();
        if let Some(previous) = previous {
            ctx.sessions.unregister(&previous, self.id);
            ctx.projection.unregister(&previous);
        }

        if let Some(replaced) = ctx
            .sessions
            .register(device_id.clone(), self.id, Arc::clone(self))
        {
            if replaced.id != self.id {
                info!(%device_id, "device connected again, closing previous session");
                replaced.close();
            }
        }
        if let Err(e) = ctx.projection.register(&ctx, &device_id).await {
            ctx.sessions.unregister(&device_id, self.id);
            return Err(e);
        }
        *self.registered_device.lock() = Some(device_id);
        Ok(old)
    }

    /// Exchange an authorization code, replaying the result of a retransmit.
    ///
    /// # Errors
    ///
    /// Returns the provider's error.
    pub async fn exchange(
        &self,
        provider: &Arc<dyn IdentityProvider>,
        code: &str,
    ) -> GatewayResult<TokenGrant> {
        let mut slot = self.exchange_cache.lock().await;
        slot.current(self.cache_generation.load(Ordering::Acquire))
            .execute(code, || provider.exchange(code))
            .await
    }

    /// Refresh tokens against every provider, replaying retransmits.
    ///
    /// # Errors
    ///
    /// Returns the first provider error when all of them fail.
    pub async fn refresh(
        &self,
        providers: &[Arc<dyn IdentityProvider>],
        refresh_token: &str,
    ) -> GatewayResult<TokenGrant> {
        let mut slot = self.refresh_cache.lock().await;
        slot.current(self.cache_generation.load(Ordering::Acquire))
            .execute(refresh_token, || refresh_with_any(providers, refresh_token))
            .await
    }

    // ---------- device I/O ----------

    /// Send `request` to the device and wait for its response.
    ///
    /// Must not be awaited on the connection's read loop.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `ConnectionClosed`.
    pub async fn request(&self, request: Message) -> GatewayResult<Message> {
        self.conn.request(request, self.request_timeout()).await
    }

    /// GET `href` on the device.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn get(&self, href: &str) -> GatewayResult<Message> {
        self.request(Message::request(Code::Get, href)).await
    }

    /// Send a message, logging failures.
    pub fn send(&self, message: Message) {
        if let Err(e) = self.conn.send(message) {
            debug!(remote_addr = %self.remote_addr(), error = %e, "cannot send message");
        }
    }

    /// Respond to `request` with `error`'s code and text.
    pub fn send_error(&self, token: Token, error: &GatewayError) {
        self.send(
            Message::response(error.coap_code(), token)
                .with_payload(MediaType::TextPlain, error.to_string()),
        );
    }

    // ---------- backend relays ----------

    /// Relay a pending backend command to the device and confirm the outcome.
    ///
    /// The backend always receives a confirmation, synthesized when the
    /// device cannot be asked. The status resource is answered locally.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is unauthenticated, the request
    /// cannot be built or delivered, or the confirmation fails.
    pub async fn relay(
        &self,
        operation: Operation,
        pending: &PendingCommand,
        service_token: &str,
    ) -> GatewayResult<()> {
        if let Err(e) = self.authorization_context() {
            self.close();
            return Err(e);
        }
        let ctx = self.context()?;
        let resource_id = &pending.resource_id;

        if resource_id.href == uri::STATUS_HREF {
            let code = match operation {
                Operation::Update => Code::MethodNotAllowed,
                Operation::Retrieve => Code::Content,
                Operation::Create | Operation::Delete => Code::Forbidden,
            };
            return self
                .confirm(
                    &ctx,
                    operation,
                    pending,
                    coap_code_to_status(code, operation),
                    Content::empty(),
                    service_token,
                )
                .await;
        }

        let request = match device_request(operation, pending) {
            Ok(request) => request,
            Err(e) => {
                self.confirm_error(&ctx, operation, pending, Code::BadRequest, &e, service_token)
                    .await;
                return Err(e);
            }
        };
        let response = match self.request(request).await {
            Ok(response) => response,
            Err(e) => {
                self.confirm_error(
                    &ctx,
                    operation,
                    pending,
                    Code::ServiceUnavailable,
                    &e,
                    service_token,
                )
                .await;
                return Err(e);
            }
        };
        if response.code == Code::NotFound {
            self.unpublish_resource_links(vec![resource_id.href.clone()], Vec::new())
                .await;
        }
        self.confirm(
            &ctx,
            operation,
            pending,
            coap_code_to_status(response.code, operation),
            content_of(&response),
            service_token,
        )
        .await
    }

    async fn confirm(
        &self,
        ctx: &ServiceContext,
        operation: Operation,
        pending: &PendingCommand,
        status: Status,
        content: Content,
        token: &str,
    ) -> GatewayResult<()> {
        let command = Command::confirm(
            operation,
            pending.resource_id.clone(),
            pending.correlation_id().clone(),
            status,
            content,
        );
        ctx.backends.aggregate.submit(token, command).await?;
        Ok(())
    }

    async fn confirm_error(
        &self,
        ctx: &ServiceContext,
        operation: Operation,
        pending: &PendingCommand,
        code: Code,
        error: &GatewayError,
        token: &str,
    ) {
        let content = Content::new(MediaType::TextPlain, error.to_string());
        let status = coap_code_to_status(code, operation);
        if let Err(e) = self
            .confirm(ctx, operation, pending, status, content, token)
            .await
        {
            warn!(
                resource_id = %pending.resource_id,
                correlation_id = %pending.correlation_id(),
                error = %e,
                "cannot confirm failed relay"
            );
        }
    }

    /// Unpublish links of the signed-in device; empty selectors mean all.
    ///
    /// Failures are logged. Returns the hrefs the backend unpublished.
    pub async fn unpublish_resource_links(
        &self,
        hrefs: Vec<String>,
        instance_ids: Vec<i64>,
    ) -> Vec<String> {
        match self.try_unpublish_resource_links(hrefs, instance_ids).await {
            Ok(unpublished) => unpublished,
            Err(e) => {
                warn!(device_id = ?self.device_id(), error = %e, "cannot unpublish resource links");
                Vec::new()
            }
        }
    }

    /// Unpublish links of the signed-in device; empty selectors mean all.
    ///
    /// Returns the hrefs the backend unpublished; their device observations
    /// are stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unauthenticated or the backend
    /// rejects the command.
    pub async fn try_unpublish_resource_links(
        &self,
        hrefs: Vec<String>,
        instance_ids: Vec<i64>,
    ) -> GatewayResult<Vec<String>> {
        let auth = self.authorization_context()?;
        let ctx = self.context()?;
        let command = Command::UnpublishResourceLinks {
            device_id: auth.device_id.clone(),
            hrefs,
            instance_ids,
        };
        let response = ctx.backends.aggregate.submit(&auth.access_token, command).await?;
        let unpublished: Vec<String> = response
            .events
            .iter()
            .filter(|e| matches!(e.event, ResourceEvent::Unpublished))
            .map(|e| e.resource_id.href.clone())
            .collect();
        self.unobserve_published(&unpublished);
        Ok(unpublished)
    }

    /// Forward content observed on the device to the backend.
    ///
    /// A NotFound answer unpublishes the resource instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unauthenticated or the backend
    /// rejects the notification.
    pub async fn notify_resource_changed(&self, href: &str, response: Message) -> GatewayResult<()> {
        let auth = self.authorization_context()?;
        let ctx = self.context()?;
        if response.code == Code::NotFound {
            self.unpublish_resource_links(vec![href.to_string()], Vec::new())
                .await;
            return Ok(());
        }
        let command = Command::NotifyResourceChanged {
            resource_id: ResourceId::new(auth.device_id.clone(), href),
            content: content_of(&response),
            status: coap_code_to_status(response.code, Operation::Retrieve),
        };
        ctx.backends
            .aggregate
            .submit(&auth.access_token, command)
            .await?;
        Ok(())
    }

    /// Report the twin synchronization state of the signed-in device.
    pub async fn report_twin_sync(&self, state: TwinSyncState) {
        let Ok(auth) = self.authorization_context() else {
            return;
        };
        let Ok(ctx) = self.context() else {
            return;
        };
        let command = Command::UpdateDeviceMetadata {
            device_id: auth.device_id.clone(),
            update: twin_proto::DeviceMetadataUpdate::TwinSynchronization { state },
        };
        if let Err(e) = ctx.backends.aggregate.submit(&auth.access_token, command).await {
            warn!(device_id = %auth.device_id, ?state, error = %e, "cannot report twin synchronization");
        }
    }

    // ---------- observations ----------

    fn device_observer(self: &Arc<Self>) -> Option<Arc<DeviceObserver>> {
        let device_id = self.device_id()?;
        let mut slot = self.device_observer.lock();
        let observer = slot.get_or_insert_with(|| DeviceObserver::new(self, device_id));
        Some(Arc::clone(observer))
    }

    /// Start observing published resources on the device.
    pub fn observe_published(self: &Arc<Self>, links: Vec<ResourceLink>) {
        if self.is_closed() {
            return;
        }
        if let Some(observer) = self.device_observer() {
            observer.add_resources(links);
        }
    }

    /// Stop observing `hrefs` on the device.
    pub fn unobserve_published(&self, hrefs: &[String]) {
        let observer = self.device_observer.lock().clone();
        if let Some(observer) = observer {
            observer.remove_resources(hrefs);
        }
    }

    /// Hrefs currently observed on the device.
    #[must_use]
    pub fn observed_hrefs(&self) -> Vec<String> {
        self.device_observer
            .lock()
            .as_ref()
            .map(|o| o.observed_hrefs())
            .unwrap_or_default()
    }

    fn close_device_observer(&self) {
        let observer = self.device_observer.lock().take();
        if let Some(observer) = observer {
            observer.close();
        }
    }

    /// Track a cloud subscription.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the token is already in use.
    pub fn add_subscription(&self, subscription: Arc<ResourceSubscription>) -> GatewayResult<()> {
        let ctx = self.context()?;
        let token = crate::observation::Observer::token(subscription.as_ref()).clone();
        {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions.contains_key(&token) {
                return Err(GatewayError::BadRequest(format!(
                    "observation with token {token} already exists"
                )));
            }
            subscriptions.insert(token.clone(), Arc::clone(&subscription));
        }
        if let Err(e) = ctx.observations.add(subscription) {
            self.subscriptions.lock().remove(&token);
            return Err(e);
        }
        Ok(())
    }

    /// Remove the subscription of `token` from the session without closing it.
    pub fn take_subscription(&self, token: &Token) -> Option<Arc<ResourceSubscription>> {
        self.subscriptions.lock().remove(token)
    }

    /// Close the subscription of `token`; false if there is none.
    pub fn cancel_subscription(&self, token: &Token) -> bool {
        match self.take_subscription(token) {
            Some(subscription) => {
                subscription.close();
                true
            }
            None => false,
        }
    }

    /// Drop the observation a device reset answered.
    ///
    /// Removes the entry registered under this connection and `token` from
    /// both the session and the observation container. False if neither had
    /// one.
    pub fn reset_subscription(&self, token: &Token) -> bool {
        let popped = self.ctx.upgrade().and_then(|ctx| {
            match ctx.observations.pop_by_remote_addr_token(self.remote_addr(), token) {
                Ok(observer) => Some(observer),
                Err(GatewayError::NotFound(_)) => None,
                Err(e) => {
                    warn!(remote_addr = %self.remote_addr(), %token, error = %e, "cannot drop observation");
                    None
                }
            }
        });
        let taken = self.take_subscription(token);
        let found = popped.is_some() || taken.is_some();
        for subscription in popped.into_iter().chain(taken) {
            subscription.close();
        }
        found
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    fn cancel_subscriptions(&self) {
        let mut subscriptions: Vec<_> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        if let Some(ctx) = self.ctx.upgrade() {
            match ctx.observations.pop_by_remote_addr(self.remote_addr()) {
                Ok(popped) => subscriptions.extend(popped),
                Err(GatewayError::NotFound(_)) => {}
                Err(e) => warn!(remote_addr = %self.remote_addr(), error = %e, "cannot drop observations"),
            }
        }
        for subscription in subscriptions {
            subscription.close();
        }
    }

    // ---------- lifecycle ----------

    /// Tear down observations and the device registration.
    ///
    /// Never waits on the device or the backend. With `reset` the
    /// authorization context is cleared too. Returns the context that was
    /// in place.
    pub fn clean_up(&self, reset: bool) -> Option<AuthorizationContext> {
        self.close_device_observer();
        self.cancel_subscriptions();
        let registered = self.registered_device.lock().take();
        if let (Some(device_id), Some(ctx)) = (registered, self.ctx.upgrade()) {
            ctx.sessions.unregister(&device_id, self.id);
            ctx.projection.unregister(&device_id);
        }
        if reset {
            // Caches drop their entries on their next use, even one in flight now.
            self.cache_generation.fetch_add(1, Ordering::AcqRel);
            self.set_authorization_context(None)
        } else {
            self.auth.lock().clone()
        }
    }

    /// Handle the connection going away.
    ///
    /// Cleans up, then reports the device offline with the last known token
    /// unless another session took the device over.
    pub async fn on_close(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::Release);
        let old = self.clean_up(false);
        let Ok(ctx) = self.context() else {
            return;
        };
        let Some(auth) = old else {
            return;
        };
        ctx.expiration.remove(&auth.device_id, self.id);
        if ctx
            .sessions
            .find(&auth.device_id)
            .is_some_and(|s| s.id != self.id)
        {
            debug!(device_id = %auth.device_id, "device served by another session");
            return;
        }
        let offline = ctx
            .status
            .update_offline(&auth.device_id, &auth.access_token);
        match tokio::time::timeout(OFFLINE_REPORT_TIMEOUT, offline).await {
            Ok(Ok(())) => debug!(device_id = %auth.device_id, "device offline"),
            Ok(Err(e)) => warn!(device_id = %auth.device_id, error = %e, "cannot report device offline"),
            Err(_) => warn!(device_id = %auth.device_id, "reporting device offline timed out"),
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(remote_addr = %self.remote_addr(), "closing session");
            self.conn.close();
        }
    }

    /// True once the session or its connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.conn.is_closed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr())
            .field("device_id", &self.device_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
