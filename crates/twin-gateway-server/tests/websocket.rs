//! Devices talking to the gateway over a real WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use twin_gateway_server::{standalone, FileConfig, GatewayServer, Standalone};
use twin_proto::messages::{SignInRequest, SignUpRequest, SignUpResponse};
use twin_proto::{uri, Code, ConnectionStatus, DeviceId, DeviceMetadataUpdate, Message};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Device = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Running {
    addr: SocketAddr,
    gateway: Standalone,
    server: Arc<GatewayServer>,
}

async fn start(extra: &str) -> Running {
    let config = FileConfig::from_toml(&format!(
        r#"
        [server]
        bind = "127.0.0.1:0"
        max_message_size = 4096
        max_violations = 1
        [gateway]
        instance_id = "gw-ws"
        {extra}
        [auth]
        jwt_secret = "websocket-secret"
        "#
    ))
    .unwrap();
    let gateway = standalone(&config).unwrap();
    let server = Arc::new(GatewayServer::new(
        config.server_config(),
        Arc::clone(&gateway.service),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve_listener(listener).await });
    }
    Running {
        addr,
        gateway,
        server,
    }
}

async fn connect(addr: SocketAddr) -> Device {
    let (ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
    ws
}

async fn send(ws: &mut Device, message: &Message) {
    ws.send(WsMessage::Text(serde_json::to_string(message).unwrap()))
        .await
        .unwrap();
}

/// Read frames until one is a response carrying `token`.
async fn response_to(ws: &mut Device, request: &Message) -> Message {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let message: Message = serde_json::from_str(&text).unwrap();
                    if message.token == request.token && message.code.is_response() {
                        return message;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .unwrap()
}

/// True once the gateway closes the socket.
async fn closed_by_gateway(ws: &mut Device) -> bool {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(WsMessage::Close(_))) => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap_or(false)
}

async fn sign_in(running: &Running, ws: &mut Device, device_id: &str, user_id: &str) {
    let code = running.gateway.provider("local").unwrap().issue_code(user_id);
    let sign_up = Message::request(Code::Post, uri::SIGN_UP)
        .with_json(&SignUpRequest {
            device_id: device_id.to_string(),
            authorization_code: code,
            authorization_provider: "local".to_string(),
        })
        .unwrap();
    send(ws, &sign_up).await;
    let response = response_to(ws, &sign_up).await;
    assert_eq!(response.code, Code::Changed, "{}", response.payload_text());
    let grant: SignUpResponse = response.decode_json().unwrap();

    let sign_in = Message::request(Code::Post, uri::SIGN_IN)
        .with_json(&SignInRequest {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            access_token: grant.access_token,
            login: true,
        })
        .unwrap();
    send(ws, &sign_in).await;
    let response = response_to(ws, &sign_in).await;
    assert_eq!(response.code, Code::Changed, "{}", response.payload_text());
}

fn statuses(running: &Running, device_id: &str) -> Vec<ConnectionStatus> {
    running
        .gateway
        .backend
        .device_metadata(&DeviceId::new(device_id))
        .into_iter()
        .filter_map(|update| match update {
            DeviceMetadataUpdate::Connection { status, .. } => Some(status),
            DeviceMetadataUpdate::TwinSynchronization { .. } => None,
        })
        .collect()
}

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ==================== Request Tests ====================

#[tokio::test]
async fn test_time_over_websocket() {
    let running = start("").await;
    let mut ws = connect(running.addr).await;

    let request = Message::request(Code::Get, uri::TIME);
    send(&mut ws, &request).await;
    let response = response_to(&mut ws, &request).await;
    assert_eq!(response.code, Code::Content);
    assert!(eventually(|| running.server.connection_count() == 1).await);
}

#[tokio::test]
async fn test_sign_in_and_disconnect_report_status() {
    let running = start("").await;
    let mut ws = connect(running.addr).await;
    sign_in(&running, &mut ws, "dev-ws", "alice").await;
    assert_eq!(statuses(&running, "dev-ws"), vec![ConnectionStatus::Online]);

    ws.close(None).await.unwrap();
    drop(ws);

    assert!(eventually(|| statuses(&running, "dev-ws").last() == Some(&ConnectionStatus::Offline)).await);
    assert!(eventually(|| running.server.connection_count() == 0).await);
}

#[tokio::test]
async fn test_unauthorized_request_closes_socket() {
    let running = start("").await;
    let mut ws = connect(running.addr).await;

    let request = Message::request(Code::Post, uri::RESOURCE_DIRECTORY);
    send(&mut ws, &request).await;
    let response = response_to(&mut ws, &request).await;
    assert_eq!(response.code, Code::Unauthorized);
    assert!(closed_by_gateway(&mut ws).await);
}

// ==================== Transport Tests ====================

#[tokio::test]
async fn test_repeated_invalid_frames_close_socket() {
    let running = start("").await;
    let mut ws = connect(running.addr).await;

    ws.send(WsMessage::Text("not json".to_string())).await.unwrap();
    ws.send(WsMessage::Text("still not json".to_string())).await.unwrap();
    assert!(closed_by_gateway(&mut ws).await);
}

#[tokio::test]
async fn test_idle_connection_is_evicted() {
    let running = start("keepalive_timeout_secs = 1").await;
    let mut ws = connect(running.addr).await;

    assert!(closed_by_gateway(&mut ws).await);
    assert!(eventually(|| running.server.connection_count() == 0).await);
}

#[tokio::test]
async fn test_shutdown_closes_signed_in_devices() {
    let running = start("").await;
    let mut ws = connect(running.addr).await;
    sign_in(&running, &mut ws, "dev-ws", "alice").await;

    running.server.shutdown();
    running.gateway.service.shutdown().await;

    assert!(closed_by_gateway(&mut ws).await);
}
