//! Cloud-side observation of one resource by one session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};
use twin_proto::{
    status_to_coap_code, Code, Message, Operation, ResourceChanged, ResourceId, Status, Token,
};

use crate::error::GatewayResult;
use crate::observation::{ObserveSequence, Observer};
use crate::service::ServiceContext;
use crate::session::Session;

/// A live observe relationship between a session and a resource.
///
/// Registered in the session's subscription map and in the process-wide
/// observation container; both entries go away on [`close`](Self::close).
pub struct ResourceSubscription {
    resource_id: ResourceId,
    remote_addr: SocketAddr,
    token: Token,
    sequence: ObserveSequence,
    last_version: Mutex<Option<u64>>,
    session: Weak<Session>,
    ctx: Weak<ServiceContext>,
    closed: AtomicBool,
}

impl ResourceSubscription {
    /// Create a subscription for `resource_id` answering requests with `token`.
    #[must_use]
    pub fn new(session: &Arc<Session>, resource_id: ResourceId, token: Token) -> Self {
        Self {
            resource_id,
            remote_addr: session.remote_addr(),
            token,
            sequence: ObserveSequence::new(),
            last_version: Mutex::new(None),
            session: Arc::downgrade(session),
            ctx: session.context_weak(),
            closed: AtomicBool::new(false),
        }
    }

    /// True once the subscription is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record `version` and report whether it was already delivered.
    fn is_duplicate(&self, version: u64) -> bool {
        let mut last = self.last_version.lock();
        if last.is_some_and(|v| v >= version) {
            return true;
        }
        *last = Some(version);
        false
    }

    /// Build a notification carrying `changed` and the next observe value.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the content type cannot be expressed as a CoAP
    /// content format.
    pub fn content_message(&self, changed: Option<&ResourceChanged>) -> GatewayResult<Message> {
        let mut msg = Message::response(Code::Content, self.token.clone())
            .with_observe(self.sequence.next_value());
        if let Some(changed) = changed {
            if let Some(media_type) = changed.content.media_type()? {
                msg = msg.with_payload(media_type, changed.content.data.clone());
            }
        }
        Ok(msg)
    }

    /// Deliver content of `version` to the observer.
    ///
    /// Versions at or below the last delivered one are dropped. Content with
    /// a failure status ends the subscription with the matching code.
    pub fn notify(&self, version: u64, changed: &ResourceChanged) {
        if self.is_closed() || self.is_duplicate(version) {
            return;
        }
        if changed.status != Status::Ok {
            self.cancel(status_to_coap_code(changed.status, Operation::Retrieve));
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match self.content_message(Some(changed)) {
            Ok(msg) => session.send(msg),
            Err(e) => {
                warn!(resource_id = %self.resource_id, error = %e, "cannot encode notification");
                self.cancel(Code::BadRequest);
            }
        }
    }

    /// End the subscription and tell the observer with `code`.
    pub fn cancel(&self, code: Code) {
        let session = self.session.upgrade();
        if let Some(ref session) = session {
            session.take_subscription(&self.token);
        }
        if !self.close() {
            return;
        }
        debug!(resource_id = %self.resource_id, token = %self.token, %code, "observation canceled");
        if let Some(session) = session {
            session.send(Message::response(code, self.token.clone()));
        }
    }

    /// Deregister from the observation container and the projection.
    ///
    /// Returns false if the subscription was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(ctx) = self.ctx.upgrade() {
            if let Err(e) =
                ctx.observations
                    .remove_by_resource(&self.resource_id, self.remote_addr, &self.token)
            {
                debug!(resource_id = %self.resource_id, error = %e, "observation already removed");
            }
            ctx.projection.unregister(&self.resource_id.device_id);
        }
        true
    }
}

impl Observer for ResourceSubscription {
    fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn token(&self) -> &Token {
        &self.token
    }
}

impl std::fmt::Debug for ResourceSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSubscription")
            .field("resource_id", &self.resource_id)
            .field("remote_addr", &self.remote_addr)
            .field("token", &self.token)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
