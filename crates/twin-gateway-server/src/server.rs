//! WebSocket gateway server implementation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};
use twin_gateway::{DeviceConnection, Service};
use twin_proto::Message;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::session::{decode_ws_message, encode_message, ViolationTracker, WsConnection};

/// Gateway server accepting device connections over WebSocket.
#[derive(Debug)]
pub struct GatewayServer {
    /// Server configuration.
    config: Arc<ServerConfig>,
    /// Gateway core shared by every connection.
    service: Arc<Service>,
    /// Open device connections.
    connections: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: watch::Sender<bool>,
}

impl GatewayServer {
    /// Create a new gateway server on top of `service`.
    #[must_use]
    pub fn new(config: ServerConfig, service: Arc<Service>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            service,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Get the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the gateway core.
    #[must_use]
    pub const fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Get the number of open device connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Bind the configured address and serve until shut down.
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the address cannot be bound.
    pub async fn serve(&self) -> ServerResult<()> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub async fn serve_listener(&self, listener: TcpListener) -> ServerResult<()> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        info!(addr = %local_addr, "gateway server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => self.handle_connection(stream, peer_addr),
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        info!("gateway server shutting down");
        Ok(())
    }

    /// Handle a new TCP connection.
    fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!(remote_addr = %peer_addr, "new connection");

        let current = self.connection_count();
        if current >= self.config.max_connections {
            warn!(
                remote_addr = %peer_addr,
                current,
                max = self.config.max_connections,
                "connection rejected: max connections reached"
            );
            return;
        }

        let config = Arc::clone(&self.config);
        let service = Arc::clone(&self.service);
        let guard = ConnectionGuard::new(Arc::clone(&self.connections));

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(remote_addr = %peer_addr, error = %e, "websocket handshake failed");
                    return;
                }
            };
            debug!(remote_addr = %peer_addr, "websocket connection established");

            match run_connection(ws_stream, peer_addr, &service, &config).await {
                Ok(()) => debug!(remote_addr = %peer_addr, "connection closed normally"),
                Err(e) => debug!(remote_addr = %peer_addr, error = %e, "connection ended with error"),
            }
            drop(guard);
        });
    }

    /// Trigger server shutdown. Open connections are closed by
    /// [`Service::shutdown`].
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Counts a connection for as long as it lives.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run one device connection until it closes.
///
/// The read loop only decodes frames, correlates responses and hands
/// requests to the service's worker pool.
async fn run_connection(
    ws_stream: WebSocketStream<TcpStream>,
    peer_addr: SocketAddr,
    service: &Arc<Service>,
    config: &ServerConfig,
) -> ServerResult<()> {
    let (conn, outbound_rx) = WsConnection::new(peer_addr, config.outbound_buffer);
    let session = service.connect(Arc::clone(&conn) as Arc<dyn DeviceConnection>);
    let (ws_sink, mut ws_read) = ws_stream.split();
    let writer = tokio::spawn(write_loop(ws_sink, outbound_rx, Arc::clone(&conn)));

    let keepalive = service.context().config.keepalive_timeout;
    let mut idle_check = tokio::time::interval((keepalive / 4).max(Duration::from_millis(10)));
    let mut violations = ViolationTracker::new();

    let result = loop {
        tokio::select! {
            frame = ws_read.next() => {
                let ws_msg = match frame {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(ServerError::from(e)),
                    Some(Ok(ws_msg)) => ws_msg,
                };
                match decode_ws_message(&ws_msg, &config.websocket) {
                    Ok(Some(message)) => {
                        conn.touch();
                        if let Some(request) = conn.route_inbound(message) {
                            service.dispatch(&session, request);
                        }
                    }
                    Ok(None) => conn.touch(),
                    Err(ServerError::ConnectionClosed) => break Ok(()),
                    Err(e) => {
                        let count = violations.record_violation();
                        warn!(remote_addr = %peer_addr, error = %e, violations = count, "invalid frame");
                        if violations.should_terminate(config.websocket.max_violations) {
                            break Err(e);
                        }
                    }
                }
            }
            () = conn.closed() => break Ok(()),
            _ = idle_check.tick() => {
                if conn.idle_for() > keepalive {
                    info!(remote_addr = %peer_addr, idle = ?conn.idle_for(), "keepalive expired, closing connection");
                    break Ok(());
                }
            }
        }
    };

    conn.close();
    service.disconnect(&session).await;
    if let Err(e) = writer.await {
        debug!(remote_addr = %peer_addr, error = %e, "writer task failed");
    }
    result
}

/// Forward queued messages to the socket; flush and close once the
/// connection is closed.
async fn write_loop<S>(mut ws_sink: S, mut outbound_rx: mpsc::Receiver<Message>, conn: Arc<WsConnection>)
where
    S: futures::Sink<tokio_tungstenite::tungstenite::Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    loop {
        tokio::select! {
            biased;
            Some(message) = outbound_rx.recv() => {
                if !send_frame(&mut ws_sink, &message).await {
                    conn.close();
                    return;
                }
            }
            () = conn.closed() => break,
        }
    }
    while let Ok(message) = outbound_rx.try_recv() {
        if !send_frame(&mut ws_sink, &message).await {
            return;
        }
    }
    let _ = ws_sink.close().await;
}

async fn send_frame<S>(ws_sink: &mut S, message: &Message) -> bool
where
    S: futures::Sink<tokio_tungstenite::tungstenite::Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let frame = match encode_message(message) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "failed to serialize outbound message");
            return true;
        }
    };
    match ws_sink.send(frame).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "websocket write failed");
            false
        }
    }
}
