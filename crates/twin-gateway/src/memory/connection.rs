//! Scripted in-process device connection.
//!
//! Plays the device side of a session: requests from the gateway are
//! answered by a responder function, and everything the gateway sends is
//! recorded for inspection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use twin_proto::{Code, Message, Token};

use crate::backend::BoxFuture;
use crate::connection::{DeviceConnection, DeviceObservation, NotifyFn};
use crate::error::{GatewayError, GatewayResult};

/// Answers a gateway request; `None` lets the request time out.
pub type Responder = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

/// Poll interval of the wait helpers.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default device behavior: success codes, no content.
fn default_response(request: &Message) -> Option<Message> {
    let code = match request.code {
        Code::Get => Code::Content,
        Code::Post => Code::Changed,
        Code::Delete => Code::Deleted,
        _ => Code::BadRequest,
    };
    Some(Message::response(code, request.token.clone()))
}

struct Observed {
    token: Token,
    notify: NotifyFn,
}

type ObservedMap = Arc<Mutex<HashMap<String, Observed>>>;
type MessageLog = Arc<Mutex<Vec<Message>>>;

/// Device connection living in the same process.
pub struct LoopbackConnection {
    remote_addr: SocketAddr,
    responder: Mutex<Responder>,
    requests: MessageLog,
    sent: Mutex<Vec<Message>>,
    observed: ObservedMap,
    closed: AtomicBool,
}

impl LoopbackConnection {
    /// Create a connection answering with success codes.
    #[must_use]
    pub fn new(remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            remote_addr,
            responder: Mutex::new(Arc::new(default_response)),
            requests: Arc::new(Mutex::new(Vec::new())),
            sent: Mutex::new(Vec::new()),
            observed: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        })
    }

    /// Replace the device behavior.
    pub fn set_responder(&self, responder: impl Fn(&Message) -> Option<Message> + Send + Sync + 'static) {
        *self.responder.lock() = Arc::new(responder);
    }

    fn respond(&self, request: &Message) -> Option<Message> {
        let responder = Arc::clone(&self.responder.lock());
        responder(request).map(|response| response.with_token(request.token.clone()))
    }

    /// Requests the gateway issued to the device.
    #[must_use]
    pub fn requests(&self) -> Vec<Message> {
        self.requests.lock().clone()
    }

    /// Messages the gateway sent without waiting: responses and notifications.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Hrefs the gateway currently observes, sorted.
    #[must_use]
    pub fn observed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.observed.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Push a notification for the observation of `path`.
    ///
    /// Returns false if `path` is not observed.
    pub fn notify(&self, path: &str, message: Message) -> bool {
        let target = self
            .observed
            .lock()
            .get(path)
            .map(|o| (o.token.clone(), Arc::clone(&o.notify)));
        let Some((token, notify)) = target else {
            return false;
        };
        notify(message.with_token(token));
        true
    }

    /// Wait until the gateway sent a message matching `predicate`.
    pub async fn wait_for_sent(
        &self,
        timeout: Duration,
        predicate: impl Fn(&Message) -> bool,
    ) -> Option<Message> {
        wait_for(&self.sent, timeout, predicate).await
    }

    /// Wait until the gateway issued a request matching `predicate`.
    pub async fn wait_for_request(
        &self,
        timeout: Duration,
        predicate: impl Fn(&Message) -> bool,
    ) -> Option<Message> {
        wait_for(&self.requests, timeout, predicate).await
    }

    fn check_open(&self) -> GatewayResult<()> {
        if self.is_closed() {
            return Err(GatewayError::ConnectionClosed);
        }
        Ok(())
    }
}

async fn wait_for(
    messages: &Mutex<Vec<Message>>,
    timeout: Duration,
    predicate: impl Fn(&Message) -> bool,
) -> Option<Message> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(found) = messages.lock().iter().find(|m| predicate(m)).cloned() {
            return Some(found);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

impl DeviceConnection for LoopbackConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn request(&self, request: Message, timeout: Duration) -> BoxFuture<'_, GatewayResult<Message>> {
        Box::pin(async move {
            self.check_open()?;
            self.requests.lock().push(request.clone());
            match self.respond(&request) {
                Some(response) => Ok(response),
                None => {
                    tokio::time::sleep(timeout).await;
                    Err(GatewayError::Timeout(format!(
                        "no response to {} {}",
                        request.code, request.path
                    )))
                }
            }
        })
    }

    fn observe(
        &self,
        path: String,
        timeout: Duration,
        notify: NotifyFn,
    ) -> BoxFuture<'_, GatewayResult<(Message, Box<dyn DeviceObservation>)>> {
        Box::pin(async move {
            let request = Message::request(Code::Get, path.clone()).with_observe(0);
            let token = request.token.clone();
            let response = self.request(request, timeout).await?;
            if !response.code.is_success() {
                return Ok((response, Box::new(NoObservation(token)) as Box<dyn DeviceObservation>));
            }
            self.observed.lock().insert(
                path.clone(),
                Observed {
                    token: token.clone(),
                    notify,
                },
            );
            let observation = LoopbackObservation {
                token,
                path,
                observed: Arc::downgrade(&self.observed),
                requests: Arc::downgrade(&self.requests),
            };
            Ok((response, Box::new(observation) as Box<dyn DeviceObservation>))
        })
    }

    fn send(&self, message: Message) -> GatewayResult<()> {
        self.check_open()?;
        self.sent.lock().push(message);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("remote_addr", &self.remote_addr)
            .field("observed", &self.observed_paths())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Handle of an established observation.
struct LoopbackObservation {
    token: Token,
    path: String,
    observed: Weak<Mutex<HashMap<String, Observed>>>,
    requests: Weak<Mutex<Vec<Message>>>,
}

impl DeviceObservation for LoopbackObservation {
    fn token(&self) -> &Token {
        &self.token
    }

    fn cancel(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            let observed = self.observed.upgrade().ok_or(GatewayError::ConnectionClosed)?;
            {
                let mut observed = observed.lock();
                if observed.get(&self.path).is_some_and(|o| o.token == self.token) {
                    observed.remove(&self.path);
                }
            }
            if let Some(requests) = self.requests.upgrade() {
                requests.lock().push(
                    Message::request(Code::Get, self.path.clone())
                        .with_token(self.token.clone())
                        .with_observe(1),
                );
            }
            Ok(())
        })
    }
}

/// Handle of an observation the device refused.
struct NoObservation(Token);

impl DeviceObservation for NoObservation {
    fn token(&self) -> &Token {
        &self.0
    }

    fn cancel(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
