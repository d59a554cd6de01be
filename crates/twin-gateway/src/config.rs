//! Gateway core configuration.

use std::time::Duration;

use twin_proto::commands::MIN_HEARTBEAT_TTL;

use crate::error::{GatewayError, GatewayResult};
use crate::worker_pool::{DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_QUEUE_SIZE, DEFAULT_WORKERS};

/// Default keepalive timeout, also the per-request device timeout.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default service heartbeat time-to-live.
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(60);

/// Default interval between expired-session sweeps.
pub const DEFAULT_EXPIRATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default claim carrying the device owner.
pub const DEFAULT_OWNER_CLAIM: &str = "sub";

/// Default protocol tag reported with the online status.
pub const DEFAULT_PROTOCOL: &str = "coap+ws";

/// How long a reported online status stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusValidity {
    /// Until the device's access token expires.
    #[default]
    TokenExpiry,
    /// A fixed window, refreshed periodically while the device is connected.
    FixedTtl(Duration),
}

/// Configuration of the gateway core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// ID of this gateway instance.
    pub instance_id: String,
    /// Device inactivity and request timeout.
    pub keepalive_timeout: Duration,
    /// Claim holding the device owner.
    pub owner_claim: String,
    /// Claim that must equal the device ID, if any.
    pub device_id_claim: Option<String>,
    /// Number of workers in each sharded pool.
    pub workers: usize,
    /// Queue depth of each worker.
    pub queue_size: usize,
    /// Device requests handled at once; more are refused.
    pub max_concurrent_requests: usize,
    /// Time-to-live of service heartbeats.
    pub heartbeat_ttl: Duration,
    /// Validity policy of device online status.
    pub status_validity: StatusValidity,
    /// Interval between expired-session sweeps.
    pub expiration_sweep_interval: Duration,
    /// Protocol tag reported with the online status.
    pub protocol: String,
    /// Endpoints where this instance is reachable.
    pub local_endpoints: Vec<String>,
}

impl ServiceConfig {
    /// Create a configuration with defaults and a random instance ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            owner_claim: DEFAULT_OWNER_CLAIM.to_string(),
            device_id_claim: None,
            workers: DEFAULT_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            heartbeat_ttl: DEFAULT_HEARTBEAT_TTL,
            status_validity: StatusValidity::TokenExpiry,
            expiration_sweep_interval: DEFAULT_EXPIRATION_SWEEP_INTERVAL,
            protocol: DEFAULT_PROTOCOL.to_string(),
            local_endpoints: Vec::new(),
        }
    }

    /// Set the instance ID.
    #[must_use]
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Set the keepalive timeout.
    #[must_use]
    pub const fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    /// Set the owner claim.
    #[must_use]
    pub fn with_owner_claim(mut self, claim: impl Into<String>) -> Self {
        self.owner_claim = claim.into();
        self
    }

    /// Require a device ID claim.
    #[must_use]
    pub fn with_device_id_claim(mut self, claim: impl Into<String>) -> Self {
        self.device_id_claim = Some(claim.into());
        self
    }

    /// Set the pool size.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize, queue_size: usize) -> Self {
        self.workers = workers;
        self.queue_size = queue_size;
        self
    }

    /// Set how many device requests may run at once.
    #[must_use]
    pub const fn with_max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit;
        self
    }

    /// Set the heartbeat time-to-live.
    #[must_use]
    pub const fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    /// Set the status validity policy.
    #[must_use]
    pub const fn with_status_validity(mut self, validity: StatusValidity) -> Self {
        self.status_validity = validity;
        self
    }

    /// Set the expiration sweep interval.
    #[must_use]
    pub const fn with_expiration_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiration_sweep_interval = interval;
        self
    }

    /// Set the reachable endpoints.
    #[must_use]
    pub fn with_local_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.local_endpoints = endpoints;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` describing the first invalid value.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.instance_id.is_empty() {
            return Err(GatewayError::BadRequest("instance ID is empty".to_string()));
        }
        if self.owner_claim.is_empty() {
            return Err(GatewayError::BadRequest("owner claim is empty".to_string()));
        }
        if self.keepalive_timeout.is_zero() {
            return Err(GatewayError::BadRequest("keepalive timeout is zero".to_string()));
        }
        if self.workers == 0 || self.queue_size == 0 {
            return Err(GatewayError::BadRequest(
                "worker count and queue size must be positive".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(GatewayError::BadRequest(
                "concurrent request limit must be positive".to_string(),
            ));
        }
        if self.heartbeat_ttl < MIN_HEARTBEAT_TTL {
            return Err(GatewayError::BadRequest(format!(
                "heartbeat TTL {:?} is less than {MIN_HEARTBEAT_TTL:?}",
                self.heartbeat_ttl
            )));
        }
        if let StatusValidity::FixedTtl(ttl) = self.status_validity {
            if ttl.is_zero() {
                return Err(GatewayError::BadRequest("status TTL is zero".to_string()));
            }
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new()
    }
}
