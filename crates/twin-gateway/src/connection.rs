//! Device connection contract.
//!
//! A connection is owned by the transport. Its read loop only decodes
//! messages and enqueues work; requests issued through this trait must
//! therefore never be awaited on the read loop itself, or the response they
//! wait for could never be read.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use twin_proto::{Message, Token};

use crate::backend::BoxFuture;
use crate::error::GatewayResult;

/// Callback receiving observation notifications from the device.
pub type NotifyFn = Arc<dyn Fn(Message) + Send + Sync>;

/// A running observation on the device.
pub trait DeviceObservation: Send + Sync {
    /// Token the observation was registered with.
    fn token(&self) -> &Token;

    /// Deregister the observation on the device.
    fn cancel(&self) -> BoxFuture<'_, GatewayResult<()>>;
}

/// One physical device connection.
pub trait DeviceConnection: Send + Sync + fmt::Debug {
    /// Remote address of the device.
    fn remote_addr(&self) -> SocketAddr;

    /// Send `request` and wait up to `timeout` for the response carrying its token.
    fn request(&self, request: Message, timeout: Duration) -> BoxFuture<'_, GatewayResult<Message>>;

    /// Start observing `path` on the device.
    ///
    /// Resolves with the first response and a handle; later notifications go
    /// to `notify`.
    fn observe(
        &self,
        path: String,
        timeout: Duration,
        notify: NotifyFn,
    ) -> BoxFuture<'_, GatewayResult<(Message, Box<dyn DeviceObservation>)>>;

    /// Send a message without waiting for a response.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the connection is gone.
    fn send(&self, message: Message) -> GatewayResult<()>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// True once the connection is closed.
    fn is_closed(&self) -> bool;
}
