//! Shared fixture: a gateway wired to the in-memory backend, driven through
//! loopback device connections.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use twin_gateway::memory::{InMemoryBackend, LocalIdentityProvider, LoopbackConnection};
use twin_gateway::{
    Backends, IdentityProvider, JwtSigner, JwtValidator, Service, ServiceConfig, Session,
    Terminator,
};
use twin_proto::messages::{PublishPayload, SignInRequest, SignUpRequest, SignUpResponse};
use twin_proto::{uri, Code, DeviceId, Message, ResourceId, ResourceLink};

/// Default wait for asynchronous effects.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Secret shared by the identity provider and the validator.
pub const SECRET: &[u8] = b"gateway-test-secret";

/// Name of the only identity provider.
pub const PROVIDER: &str = "local";

static NEXT_PORT: AtomicU16 = AtomicU16::new(40_000);

fn next_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Counts terminate calls.
#[derive(Debug, Default)]
pub struct CountingTerminator {
    calls: AtomicU32,
}

impl CountingTerminator {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Terminator for CountingTerminator {
    fn terminate(&self, _reason: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// A device connected to the gateway.
pub struct TestDevice {
    pub device_id: DeviceId,
    pub user_id: String,
    pub conn: Arc<LoopbackConnection>,
    pub session: Arc<Session>,
    pub access_token: String,
    pub refresh_token: String,
}

impl TestDevice {
    pub fn resource(&self, href: &str) -> ResourceId {
        ResourceId::new(self.device_id.clone(), href)
    }
}

/// Gateway under test.
pub struct Harness {
    pub backend: Arc<InMemoryBackend>,
    pub provider: Arc<LocalIdentityProvider>,
    pub service: Service,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    /// Defaults tuned for tests: short timeouts, small pools.
    pub fn config() -> ServiceConfig {
        ServiceConfig::new()
            .with_instance_id("gw-test")
            .with_keepalive_timeout(Duration::from_secs(2))
            .with_workers(4, 64)
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        Self::with_backends(config, |_, _| {})
    }

    /// Gateway whose collaborators `customize` may replace, e.g. to wrap
    /// the backend.
    pub fn with_backends(
        config: ServiceConfig,
        customize: impl FnOnce(&Arc<InMemoryBackend>, &mut Backends),
    ) -> Self {
        let backend = InMemoryBackend::new("service-token");
        let provider = Arc::new(LocalIdentityProvider::new(PROVIDER, JwtSigner::new(SECRET)));
        let mut backends = Backends {
            aggregate: backend.clone(),
            directory: backend.clone(),
            bus: backend.clone(),
            identity_store: backend.clone(),
            providers: vec![provider.clone() as Arc<dyn IdentityProvider>],
            validator: Arc::new(JwtValidator::new(SECRET)),
            service_tokens: backend.clone(),
        };
        customize(&backend, &mut backends);
        let service = Service::new(config, backends).unwrap();
        Self {
            backend,
            provider,
            service,
        }
    }

    /// Open a connection without signing anything.
    pub fn connect(&self) -> (Arc<LoopbackConnection>, Arc<Session>) {
        let conn = LoopbackConnection::new(next_addr());
        let session = self.service.connect(conn.clone());
        (conn, session)
    }

    /// Process `request` inline and return the gateway's answer to it.
    pub async fn request(
        &self,
        conn: &LoopbackConnection,
        session: &Arc<Session>,
        request: Message,
    ) -> Message {
        let token = request.token.clone();
        self.service.process(session, request).await;
        conn.wait_for_sent(TEST_TIMEOUT, |m| m.token == token && m.code.is_response())
            .await
            .unwrap()
    }

    /// Connect, sign up and sign in `device_id` on behalf of `user_id`.
    pub async fn sign_in_device(&self, device_id: &str, user_id: &str) -> TestDevice {
        let (conn, session) = self.connect();
        let code = self.provider.issue_code(user_id);
        let sign_up = Message::request(Code::Post, uri::SIGN_UP)
            .with_json(&SignUpRequest {
                device_id: device_id.to_string(),
                authorization_code: code,
                authorization_provider: PROVIDER.to_string(),
            })
            .unwrap();
        let response = self.request(&conn, &session, sign_up).await;
        assert_eq!(response.code, Code::Changed, "{}", response.payload_text());
        let grant: SignUpResponse = response.decode_json().unwrap();

        let sign_in = Message::request(Code::Post, uri::SIGN_IN)
            .with_json(&SignInRequest {
                device_id: device_id.to_string(),
                user_id: user_id.to_string(),
                access_token: grant.access_token.clone(),
                login: true,
            })
            .unwrap();
        let response = self.request(&conn, &session, sign_in).await;
        assert_eq!(response.code, Code::Changed, "{}", response.payload_text());

        TestDevice {
            device_id: DeviceId::new(device_id),
            user_id: user_id.to_string(),
            conn,
            session,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
        }
    }

    /// Publish `links` from `device` and return the response.
    pub async fn publish(&self, device: &TestDevice, links: Vec<ResourceLink>) -> Message {
        let request = Message::request(Code::Post, uri::RESOURCE_DIRECTORY)
            .with_json(&PublishPayload {
                device_id: device.device_id.to_string(),
                links,
                ttl: 0,
            })
            .unwrap();
        self.request(&device.conn, &device.session, request).await
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
