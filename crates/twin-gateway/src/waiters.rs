//! Request-scoped waiters for command completions.
//!
//! A handler that issues a command registers the command's correlation ID
//! and waits; the projection delivers the matching completion without ever
//! blocking on a slow or absent waiter.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use twin_proto::{CorrelationId, Operation, ResourceCompleted};

use crate::error::{GatewayError, GatewayResult};

type Slot = mpsc::Sender<(Operation, ResourceCompleted)>;

/// Registry of pending completion waiters keyed by correlation ID.
#[derive(Debug, Default)]
pub struct CompletionWaiters {
    slots: Arc<Mutex<HashMap<CorrelationId, Slot>>>,
}

impl CompletionWaiters {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `correlation_id`.
    #[must_use]
    pub fn register(&self, correlation_id: CorrelationId) -> Waiter {
        let (tx, rx) = mpsc::channel(1);
        self.slots.lock().insert(correlation_id.clone(), tx);
        Waiter {
            correlation_id,
            rx,
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Deliver a completion; a missing or full waiter is skipped.
    pub fn complete(&self, operation: Operation, completed: ResourceCompleted) {
        let slot = self.slots.lock().get(completed.correlation_id()).cloned();
        let Some(slot) = slot else {
            return;
        };
        let correlation_id = completed.correlation_id().clone();
        if slot.try_send((operation, completed)).is_err() {
            debug!(correlation_id = %correlation_id, "completion waiter is full or gone");
        }
    }

    /// Number of registered waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True when nobody waits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// Receives the completion of one command; deregisters on drop.
#[derive(Debug)]
pub struct Waiter {
    correlation_id: CorrelationId,
    rx: mpsc::Receiver<(Operation, ResourceCompleted)>,
    slots: Weak<Mutex<HashMap<CorrelationId, Slot>>>,
}

impl Waiter {
    /// Correlation ID being waited for.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait up to `timeout` for the completion.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if nothing arrives in time.
    pub async fn wait(mut self, timeout: Duration) -> GatewayResult<(Operation, ResourceCompleted)> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(completed)) => Ok(completed),
            Ok(None) => Err(GatewayError::ServiceUnavailable(format!(
                "waiter {} closed",
                self.correlation_id
            ))),
            Err(_) => Err(GatewayError::Timeout(format!(
                "no completion for {} within {timeout:?}",
                self.correlation_id
            ))),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.lock().remove(&self.correlation_id);
        }
    }
}
