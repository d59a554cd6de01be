//! Per-connection WebSocket transport.
//!
//! Every WebSocket frame carries one JSON-encoded CoAP [`Message`].
//! [`WsConnection`] implements the gateway's [`DeviceConnection`] on top of
//! an outbound queue: requests to the device wait on a oneshot keyed by
//! token, and notifications of established observations go to their
//! callbacks. Inbound messages that are neither are handed back to the
//! server for dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use twin_gateway::{
    BoxFuture, DeviceConnection, DeviceObservation, GatewayError, GatewayResult, NotifyFn,
};
use twin_proto::{Code, Message, Token};

use crate::config::WebSocketConfig;
use crate::error::{ServerError, ServerResult};

/// Tracks message violations for a connection.
#[derive(Debug, Default)]
pub struct ViolationTracker {
    count: u32,
}

impl ViolationTracker {
    /// Create a new violation tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self { count: 0 }
    }

    /// Record a violation and return the current count.
    pub fn record_violation(&mut self) -> u32 {
        self.count = self.count.saturating_add(1);
        self.count
    }

    /// Get the current violation count.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// True once the number of violations exceeds `max_violations`.
    #[must_use]
    pub const fn should_terminate(&self, max_violations: u32) -> bool {
        self.count > max_violations
    }
}

/// Get the size of a WebSocket message in bytes.
#[must_use]
pub fn ws_message_size(ws_msg: &WsMessage) -> usize {
    match ws_msg {
        WsMessage::Text(text) => text.len(),
        WsMessage::Binary(data) | WsMessage::Ping(data) | WsMessage::Pong(data) => data.len(),
        WsMessage::Close(frame) => frame.as_ref().map_or(0, |f| f.reason.len() + 2),
        WsMessage::Frame(frame) => frame.len(),
    }
}

/// Check if a WebSocket message size is within the allowed limits.
///
/// # Errors
///
/// Returns `ServerError::MessageTooLarge` if the message exceeds the configured limit.
pub fn validate_message_size(ws_msg: &WsMessage, config: &WebSocketConfig) -> ServerResult<()> {
    let size = ws_message_size(ws_msg);
    if config.is_message_size_valid(size) {
        Ok(())
    } else {
        Err(ServerError::MessageTooLarge {
            size,
            limit: config.max_message_size,
        })
    }
}

/// Decode a WebSocket frame into a CoAP message.
///
/// Returns `None` for control frames.
///
/// # Errors
///
/// Returns `MessageTooLarge`, `Serialization` for undecodable payloads and
/// `ConnectionClosed` for a close frame.
pub fn decode_ws_message(ws_msg: &WsMessage, config: &WebSocketConfig) -> ServerResult<Option<Message>> {
    validate_message_size(ws_msg, config)?;
    match ws_msg {
        WsMessage::Text(text) => Ok(Some(serde_json::from_str(text)?)),
        WsMessage::Binary(data) => Ok(Some(serde_json::from_slice(data)?)),
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
        WsMessage::Close(_) => {
            debug!("received close frame");
            Err(ServerError::ConnectionClosed)
        }
    }
}

/// Encode a CoAP message as a WebSocket text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_message(message: &Message) -> ServerResult<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(message)?))
}

type PendingMap = Mutex<HashMap<Token, oneshot::Sender<Message>>>;
type ObservationMap = Mutex<HashMap<Token, NotifyFn>>;

/// Device connection over one WebSocket.
pub struct WsConnection {
    this: Weak<Self>,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    pending: PendingMap,
    observations: ObservationMap,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl WsConnection {
    /// Create a connection whose outbound messages are queued on the
    /// returned receiver.
    #[must_use]
    pub fn new(remote_addr: SocketAddr, buffer: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let (closed_tx, _) = watch::channel(false);
        let conn = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            remote_addr,
            outbound,
            pending: Mutex::new(HashMap::new()),
            observations: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            closed_tx,
        });
        (conn, rx)
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound message.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives as long as `self`, so waiting cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of requests waiting for a device response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of observations registered on the device.
    #[must_use]
    pub fn observation_count(&self) -> usize {
        self.observations.lock().len()
    }

    /// Route an inbound message.
    ///
    /// Responses to outstanding requests and observation notifications are
    /// consumed here; anything else is returned for dispatch to the gateway.
    pub fn route_inbound(&self, message: Message) -> Option<Message> {
        if !message.code.is_response() || message.token.is_empty() {
            return Some(message);
        }
        let waiter = self.pending.lock().remove(&message.token);
        if let Some(waiter) = waiter {
            if let Err(unclaimed) = waiter.send(message) {
                debug!(remote_addr = %self.remote_addr, token = %unclaimed.token, "response arrived after timeout");
            }
            return None;
        }
        let notify = self.observations.lock().get(&message.token).cloned();
        if let Some(notify) = notify {
            notify(message);
            return None;
        }
        debug!(remote_addr = %self.remote_addr, token = %message.token, code = %message.code, "unmatched response dropped");
        None
    }

    fn enqueue(&self, message: Message) -> GatewayResult<()> {
        if self.is_closed() {
            return Err(GatewayError::ConnectionClosed);
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                GatewayError::ServiceUnavailable("outbound queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => GatewayError::ConnectionClosed,
        })
    }

    async fn exchange(&self, request: Message, timeout: Duration) -> GatewayResult<Message> {
        let token = request.token.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token.clone(), tx);
        let description = format!("{} {}", request.code, request.path);
        if let Err(e) = self.enqueue(request) {
            self.pending.lock().remove(&token);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&token);
                Err(GatewayError::Timeout(format!("no response to {description}")))
            }
        }
    }
}

impl DeviceConnection for WsConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn request(&self, request: Message, timeout: Duration) -> BoxFuture<'_, GatewayResult<Message>> {
        Box::pin(self.exchange(request, timeout))
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
            // Registered first: the device may notify before the response is routed.
            self.observations.lock().insert(token.clone(), notify);
            let response = match self.exchange(request, timeout).await {
                Ok(response) => response,
                Err(e) => {
                    self.observations.lock().remove(&token);
                    return Err(e);
                }
            };
            if !response.code.is_success() || response.observe.is_none() {
                self.observations.lock().remove(&token);
                debug!(remote_addr = %self.remote_addr, %path, code = %response.code, "device declined observation");
            }
            let observation = WsObservation {
                token,
                path,
                conn: self.this.clone(),
                timeout,
            };
            Ok((response, Box::new(observation) as Box<dyn DeviceObservation>))
        })
    }

    fn send(&self, message: Message) -> GatewayResult<()> {
        self.enqueue(message)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(remote_addr = %self.remote_addr, "closing connection");
        // Dropping the senders fails every outstanding request.
        self.pending.lock().clear();
        self.observations.lock().clear();
        self.closed_tx.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("remote_addr", &self.remote_addr)
            .field("pending", &self.pending_requests())
            .field("observations", &self.observation_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Observation established over a [`WsConnection`].
struct WsObservation {
    token: Token,
    path: String,
    conn: Weak<WsConnection>,
    timeout: Duration,
}

impl DeviceObservation for WsObservation {
    fn token(&self) -> &Token {
        &self.token
    }

    fn cancel(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            let conn = self.conn.upgrade().ok_or(GatewayError::ConnectionClosed)?;
            if conn.observations.lock().remove(&self.token).is_none() {
                return Ok(());
            }
            if conn.is_closed() {
                return Ok(());
            }
            let deregister = Message::request(Code::Get, self.path.clone())
                .with_token(self.token.clone())
                .with_observe(1);
            match conn.exchange(deregister, self.timeout).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    warn!(remote_addr = %conn.remote_addr, path = %self.path, error = %e, "cannot cancel observation");
                    Err(e)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use twin_proto::MediaType;

    fn addr() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn answer(request: &Message, code: Code) -> Message {
        Message::response(code, request.token.clone())
    }

    // ==================== ViolationTracker Tests ====================

    #[test]
    fn test_violation_tracker() {
        let mut tracker = ViolationTracker::new();
        assert_eq!(tracker.record_violation(), 1);
        assert!(!tracker.should_terminate(1));
        assert_eq!(tracker.record_violation(), 2);
        assert!(tracker.should_terminate(1));
        assert_eq!(tracker.count(), 2);
    }

    proptest! {
        #[test]
        fn prop_violations_terminate_past_limit(violations in 0u32..20, max in 0u32..10) {
            let mut tracker = ViolationTracker::new();
            for _ in 0..violations {
                tracker.record_violation();
            }
            prop_assert_eq!(tracker.should_terminate(max), violations > max);
        }
    }

    // ==================== Framing Tests ====================

    #[test]
    fn test_decode_text_frame() {
        let message = Message::request(Code::Post, "/oic/ping");
        let frame = encode_message(&message).unwrap();
        let decoded = decode_ws_message(&frame, &WebSocketConfig::new()).unwrap();
        assert_eq!(decoded, Some(message));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let message = Message::request(Code::Post, "/oic/rd")
            .with_payload(MediaType::AppJson, vec![b'x'; 256]);
        let frame = encode_message(&message).unwrap();
        let config = WebSocketConfig::new().with_max_message_size(64);
        assert!(matches!(
            decode_ws_message(&frame, &config),
            Err(ServerError::MessageTooLarge { limit: 64, .. })
        ));
    }

    #[test]
    fn test_decode_control_frames() {
        let config = WebSocketConfig::new();
        assert!(decode_ws_message(&WsMessage::Ping(vec![1]), &config).unwrap().is_none());
        assert!(matches!(
            decode_ws_message(&WsMessage::Close(None), &config),
            Err(ServerError::ConnectionClosed)
        ));
        assert!(matches!(
            decode_ws_message(&WsMessage::Text("{".to_string()), &config),
            Err(ServerError::Serialization(_))
        ));
    }

    // ==================== WsConnection Tests ====================

    #[tokio::test]
    async fn test_request_is_answered_by_token() {
        let (conn, mut rx) = WsConnection::new(addr(), 8);
        let device = Arc::clone(&conn);
        let responder = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert!(device.route_inbound(answer(&request, Code::Content)).is_none());
        });

        let response = conn
            .request(Message::request(Code::Get, "/light/1"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.code, Code::Content);
        responder.await.unwrap();
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (conn, _rx) = WsConnection::new(addr(), 8);
        let result = conn
            .request(Message::request(Code::Get, "/light/1"), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_requests() {
        let (conn, _rx) = WsConnection::new(addr(), 8);
        let waiting = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.request(Message::request(Code::Get, "/light/1"), Duration::from_secs(5))
                    .await
            })
        };
        while conn.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }
        conn.close();
        assert!(matches!(waiting.await.unwrap(), Err(GatewayError::ConnectionClosed)));
        assert!(conn.send(Message::empty()).is_err());
        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_are_passed_through() {
        let (conn, _rx) = WsConnection::new(addr(), 8);
        let request = Message::request(Code::Post, "/oic/sec/session");
        assert_eq!(conn.route_inbound(request.clone()), Some(request));
        let ping = Message::empty();
        assert_eq!(conn.route_inbound(ping.clone()), Some(ping));
    }

    #[tokio::test]
    async fn test_full_queue_is_unavailable() {
        let (conn, _rx) = WsConnection::new(addr(), 1);
        conn.send(Message::empty()).unwrap();
        assert!(matches!(
            conn.send(Message::empty()),
            Err(GatewayError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_observation_notifications_and_cancel() {
        let (conn, mut rx) = WsConnection::new(addr(), 8);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let notify: NotifyFn = Arc::new(move |m: Message| sink.lock().push(m));

        let device = Arc::clone(&conn);
        let script = tokio::spawn(async move {
            let observe = rx.recv().await.unwrap();
            assert_eq!(observe.observe, Some(0));
            device.route_inbound(answer(&observe, Code::Content).with_observe(2));
            device.route_inbound(answer(&observe, Code::Content).with_observe(3));

            let cancel = rx.recv().await.unwrap();
            assert_eq!(cancel.observe, Some(1));
            assert_eq!(cancel.token, observe.token);
            device.route_inbound(answer(&cancel, Code::Content));
        });

        let (first, observation) = conn
            .observe("/light/1".to_string(), Duration::from_secs(1), notify)
            .await
            .unwrap();
        assert_eq!(first.observe, Some(2));
        while received.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(received.lock()[0].observe, Some(3));
        assert_eq!(conn.observation_count(), 1);

        observation.cancel().await.unwrap();
        script.await.unwrap();
        assert_eq!(conn.observation_count(), 0);
    }

    #[tokio::test]
    async fn test_declined_observation_is_not_registered() {
        let (conn, mut rx) = WsConnection::new(addr(), 8);
        let device = Arc::clone(&conn);
        tokio::spawn(async move {
            let observe = rx.recv().await.unwrap();
            device.route_inbound(answer(&observe, Code::NotFound));
        });

        let (first, observation) = conn
            .observe("/missing".to_string(), Duration::from_secs(1), Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(first.code, Code::NotFound);
        assert_eq!(conn.observation_count(), 0);
        observation.cancel().await.unwrap();
    }
}
