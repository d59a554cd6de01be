//! Server configuration.
//!
//! [`ServerConfig`] and [`WebSocketConfig`] shape the listener; [`FileConfig`]
//! is the TOML file the binary loads, covering the listener, the gateway core
//! and the identity setup of a standalone deployment.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use twin_gateway::config::{
    DEFAULT_EXPIRATION_SWEEP_INTERVAL, DEFAULT_HEARTBEAT_TTL, DEFAULT_KEEPALIVE_TIMEOUT,
    DEFAULT_OWNER_CLAIM,
};
use twin_gateway::{ServiceConfig, StatusValidity};
use twin_proto::commands::MIN_HEARTBEAT_TTL;

use crate::error::{ServerError, ServerResult};

/// Default maximum WebSocket message size: 64KB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default maximum violations before connection termination.
pub const DEFAULT_MAX_VIOLATIONS: u32 = 3;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5683";

/// Default depth of each connection's outbound queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Configuration for WebSocket message handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Maximum allowed message size in bytes.
    pub max_message_size: usize,
    /// Maximum number of size or decode violations before terminating the
    /// connection. Set to 0 to close on the first violation.
    pub max_violations: u32,
}

impl WebSocketConfig {
    /// Create a WebSocket configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_violations: DEFAULT_MAX_VIOLATIONS,
        }
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the maximum number of violations before termination.
    #[must_use]
    pub const fn with_max_violations(mut self, max: u32) -> Self {
        self.max_violations = max;
        self
    }

    /// Check if a message size is within the allowed limit.
    #[must_use]
    pub const fn is_message_size_valid(&self, size: usize) -> bool {
        size <= self.max_message_size
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the gateway server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket server to.
    pub bind_addr: SocketAddr,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Depth of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// WebSocket configuration for message size limits.
    pub websocket: WebSocketConfig,
}

impl ServerConfig {
    /// Create a server configuration with the specified bind address.
    #[must_use]
    pub const fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 10_000,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            websocket: WebSocketConfig::new(),
        }
    }

    /// Set the WebSocket configuration.
    #[must_use]
    pub const fn with_websocket_config(mut self, config: WebSocketConfig) -> Self {
        self.websocket = config;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the outbound queue depth.
    #[must_use]
    pub const fn with_outbound_buffer(mut self, depth: usize) -> Self {
        self.outbound_buffer = depth;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(([0, 0, 0, 0], 5683).into())
    }
}

// ---------- file configuration ----------

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Listen address.
    pub bind: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Violations tolerated before a connection is dropped.
    pub max_violations: u32,
    /// Depth of each connection's outbound queue.
    pub outbound_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: defaults.bind_addr,
            max_connections: defaults.max_connections,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_violations: DEFAULT_MAX_VIOLATIONS,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

/// `[gateway]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    /// Instance ID; a random UUID when absent.
    pub instance_id: Option<String>,
    /// Device inactivity and request timeout in seconds.
    pub keepalive_timeout_secs: u64,
    /// Claim holding the device owner.
    pub owner_claim: String,
    /// Claim that must equal the device ID.
    pub device_id_claim: Option<String>,
    /// Workers per sharded pool.
    pub workers: usize,
    /// Queue depth per worker.
    pub queue_size: usize,
    /// Device requests handled at once.
    pub max_concurrent_requests: usize,
    /// Service heartbeat time-to-live in seconds.
    pub heartbeat_ttl_secs: u64,
    /// Fixed online-status validity in seconds; token expiry when absent.
    pub status_ttl_secs: Option<u64>,
    /// Interval between expired-session sweeps in seconds.
    pub expiration_sweep_secs: u64,
    /// Endpoints reported with the online status.
    pub local_endpoints: Vec<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let defaults = ServiceConfig::new();
        Self {
            instance_id: None,
            keepalive_timeout_secs: DEFAULT_KEEPALIVE_TIMEOUT.as_secs(),
            owner_claim: DEFAULT_OWNER_CLAIM.to_string(),
            device_id_claim: None,
            workers: defaults.workers,
            queue_size: defaults.queue_size,
            max_concurrent_requests: defaults.max_concurrent_requests,
            heartbeat_ttl_secs: DEFAULT_HEARTBEAT_TTL.as_secs(),
            status_ttl_secs: None,
            expiration_sweep_secs: DEFAULT_EXPIRATION_SWEEP_INTERVAL.as_secs(),
            local_endpoints: Vec::new(),
        }
    }
}

/// One identity provider of the `[auth]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSection {
    /// Name devices pass as `authprovider`.
    pub name: String,
    /// Access token lifetime in seconds; tokens never expire when absent.
    #[serde(default)]
    pub token_ttl_secs: Option<u64>,
}

/// `[auth]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    /// HMAC secret shared by token signing and validation.
    pub jwt_secret: String,
    /// Required `iss` claim.
    pub issuer: Option<String>,
    /// Credential the gateway uses for its own backend calls.
    pub service_token: String,
    /// Identity providers devices enroll with.
    pub providers: Vec<ProviderSection>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: None,
            service_token: "twin-gateway".to_string(),
            providers: vec![ProviderSection {
                name: "local".to_string(),
                token_ttl_secs: None,
            }],
        }
    }
}

/// TOML configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Listener settings.
    pub server: ServerSection,
    /// Gateway core settings.
    pub gateway: GatewaySection,
    /// Token and provider settings.
    pub auth: AuthSection,
}

impl FileConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServerError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ServerError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> ServerResult<()> {
        if Duration::from_secs(self.gateway.heartbeat_ttl_secs) < MIN_HEARTBEAT_TTL {
            return Err(ServerError::Config(format!(
                "heartbeat_ttl_secs must be at least {}",
                MIN_HEARTBEAT_TTL.as_secs()
            )));
        }
        if self.gateway.owner_claim.is_empty() {
            return Err(ServerError::Config("owner_claim cannot be empty".to_string()));
        }
        if self.gateway.workers == 0 {
            return Err(ServerError::Config("workers must be positive".to_string()));
        }
        if self.server.max_connections == 0 {
            return Err(ServerError::Config(
                "max_connections must be positive".to_string(),
            ));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(ServerError::Config("jwt_secret cannot be empty".to_string()));
        }
        if self.auth.service_token.is_empty() {
            return Err(ServerError::Config("service_token cannot be empty".to_string()));
        }
        if self.auth.providers.is_empty() {
            return Err(ServerError::Config(
                "at least one provider is required".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for provider in &self.auth.providers {
            if provider.name.is_empty() {
                return Err(ServerError::Config("provider name cannot be empty".to_string()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ServerError::Config(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
        }
        self.service_config().validate()?;
        Ok(())
    }

    /// Listener configuration.
    #[must_use]
    pub const fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.server.bind)
            .with_max_connections(self.server.max_connections)
            .with_outbound_buffer(self.server.outbound_buffer)
            .with_websocket_config(
                WebSocketConfig::new()
                    .with_max_message_size(self.server.max_message_size)
                    .with_max_violations(self.server.max_violations),
            )
    }

    /// Gateway core configuration.
    #[must_use]
    pub fn service_config(&self) -> ServiceConfig {
        let gateway = &self.gateway;
        let mut config = ServiceConfig::new()
            .with_keepalive_timeout(Duration::from_secs(gateway.keepalive_timeout_secs))
            .with_owner_claim(gateway.owner_claim.clone())
            .with_workers(gateway.workers, gateway.queue_size)
            .with_max_concurrent_requests(gateway.max_concurrent_requests)
            .with_heartbeat_ttl(Duration::from_secs(gateway.heartbeat_ttl_secs))
            .with_expiration_sweep_interval(Duration::from_secs(gateway.expiration_sweep_secs))
            .with_local_endpoints(gateway.local_endpoints.clone());
        if let Some(ref id) = gateway.instance_id {
            config = config.with_instance_id(id.clone());
        }
        if let Some(ref claim) = gateway.device_id_claim {
            config = config.with_device_id_claim(claim.clone());
        }
        if let Some(ttl) = gateway.status_ttl_secs {
            config = config.with_status_validity(StatusValidity::FixedTtl(Duration::from_secs(ttl)));
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const MINIMAL: &str = r#"
        [auth]
        jwt_secret = "secret"
    "#;

    // ==================== WebSocketConfig Tests ====================

    #[test]
    fn test_websocket_config_new() {
        let config = WebSocketConfig::new();
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.max_violations, DEFAULT_MAX_VIOLATIONS);
    }

    #[test]
    fn test_message_size_limit_is_inclusive() {
        let config = WebSocketConfig::new().with_max_message_size(100);
        assert!(config.is_message_size_valid(100));
        assert!(!config.is_message_size_valid(101));
    }

    // ==================== ServerConfig Tests ====================

    #[test]
    fn test_server_config_builder() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ServerConfig::new(addr)
            .with_max_connections(5)
            .with_outbound_buffer(8);
        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.outbound_buffer, 8);
    }

    // ==================== FileConfig Tests ====================

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = tokio_test::assert_ok!(FileConfig::from_toml(MINIMAL));
        assert_eq!(config.server.bind, DEFAULT_BIND_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(config.auth.providers.len(), 1);

        let service = config.service_config();
        assert_eq!(service.keepalive_timeout, DEFAULT_KEEPALIVE_TIMEOUT);
        assert_eq!(service.owner_claim, DEFAULT_OWNER_CLAIM);
        assert_eq!(service.status_validity, StatusValidity::TokenExpiry);
    }

    #[test]
    fn test_full_file() {
        let config = FileConfig::from_toml(
            r#"
            [server]
            bind = "127.0.0.1:7000"
            max_message_size = 4096

            [gateway]
            instance_id = "gw-1"
            keepalive_timeout_secs = 30
            device_id_claim = "https://twin/deviceId"
            status_ttl_secs = 300

            [auth]
            jwt_secret = "secret"
            issuer = "https://auth.example"
            providers = [{ name = "plgd", token_ttl_secs = 3600 }, { name = "local" }]
            "#,
        )
        .unwrap();

        let server = config.server_config();
        assert_eq!(server.bind_addr.port(), 7000);
        assert_eq!(server.websocket.max_message_size, 4096);

        let service = config.service_config();
        assert_eq!(service.instance_id, "gw-1");
        assert_eq!(service.keepalive_timeout, Duration::from_secs(30));
        assert_eq!(service.device_id_claim.as_deref(), Some("https://twin/deviceId"));
        assert_eq!(
            service.status_validity,
            StatusValidity::FixedTtl(Duration::from_secs(300))
        );
    }

    #[test_case("[gateway]\nheartbeat_ttl_secs = 0" ; "heartbeat below minimum")]
    #[test_case("[gateway]\nowner_claim = \"\"" ; "empty owner claim")]
    #[test_case("[gateway]\nworkers = 0" ; "no workers")]
    #[test_case("[gateway]\nmax_concurrent_requests = 0" ; "no concurrent requests")]
    #[test_case("[auth]\nproviders = [{ name = \"\" }]" ; "empty provider name")]
    #[test_case("[auth]\nproviders = [{ name = \"a\" }, { name = \"a\" }]" ; "duplicate provider")]
    #[test_case("[auth]\nproviders = []" ; "no providers")]
    fn test_invalid_file_is_rejected(section: &str) {
        // Merge the secret into the [auth] table when the case defines one.
        let content = if section.starts_with("[auth]") {
            format!("{section}\njwt_secret = \"secret\"")
        } else {
            format!("{MINIMAL}\n{section}")
        };
        let err = FileConfig::from_toml(&content).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)), "{err}");
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        assert!(FileConfig::from_toml("").is_err());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = FileConfig::from_toml(&format!("{MINIMAL}\n[server]\nport = 1")).unwrap_err();
        assert!(err.to_string().contains("invalid TOML"));
    }
}
