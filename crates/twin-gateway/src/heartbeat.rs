//! Service liveness heartbeat.
//!
//! The instance reports itself alive at least twice per TTL. Once a report
//! fails repeatedly, or the last granted validity has lapsed, the backend may
//! already treat every device on this instance as offline, so the instance
//! terminates instead of serving devices it no longer owns.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use twin_proto::{Command, ServiceHeartbeat};

use crate::backend::{ResourceAggregate, ServiceTokenProvider};
use crate::error::GatewayResult;

/// Consecutive failures that terminate the instance.
pub const DEFAULT_MAX_FAILURES: u32 = 2;

/// Stops the process when liveness is lost.
pub trait Terminator: Send + Sync {
    /// Terminate with `reason`. Called at most once per heartbeat.
    fn terminate(&self, reason: &str);
}

/// Heartbeat settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Reporting instance.
    pub service_id: String,
    /// Validity requested per report.
    pub time_to_live: Duration,
    /// Consecutive failures before terminating.
    pub max_failures: u32,
}

impl HeartbeatConfig {
    /// Create settings with the default failure budget.
    #[must_use]
    pub fn new(service_id: impl Into<String>, time_to_live: Duration) -> Self {
        Self {
            service_id: service_id.into(),
            time_to_live,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }

    /// Set the failure budget.
    #[must_use]
    pub const fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Interval between reports: half the TTL.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.time_to_live / 2
    }
}

/// What to do after a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep reporting.
    Continue,
    /// Liveness is lost.
    Terminate,
}

/// Tracks consecutive failures and the last granted validity.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    failures: u32,
    max_failures: u32,
    valid_until: Option<DateTime<Utc>>,
}

impl HeartbeatMonitor {
    /// Create a monitor terminating after `max_failures` failures in a row.
    #[must_use]
    pub const fn new(max_failures: u32) -> Self {
        Self {
            failures: 0,
            max_failures,
            valid_until: None,
        }
    }

    /// Consecutive failures so far.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Validity granted by the last successful report.
    #[must_use]
    pub const fn valid_until(&self) -> Option<DateTime<Utc>> {
        self.valid_until
    }

    /// True when the validity granted by the last report ended before `now`.
    #[must_use]
    pub fn lapsed(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|v| now > v)
    }

    /// Record a report at `now` that granted `valid_until`.
    ///
    /// A report arriving after the previous validity ended does not restore
    /// liveness: the backend may already have released this instance's devices.
    pub fn on_success(&mut self, now: DateTime<Utc>, valid_until: DateTime<Utc>) -> Verdict {
        let lapsed = self.lapsed(now);
        self.failures = 0;
        self.valid_until = Some(valid_until);
        if lapsed {
            Verdict::Terminate
        } else {
            Verdict::Continue
        }
    }

    /// Record a failed report at `now`.
    pub fn on_failure(&mut self, now: DateTime<Utc>) -> Verdict {
        self.failures += 1;
        if self.failures >= self.max_failures || self.lapsed(now) {
            Verdict::Terminate
        } else {
            Verdict::Continue
        }
    }
}

/// Handle for controlling the heartbeat task.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    running: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    failures: Arc<AtomicU32>,
    valid_until: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl HeartbeatHandle {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            terminated: Arc::new(AtomicBool::new(false)),
            failures: Arc::new(AtomicU32::new(0)),
            valid_until: Arc::new(Mutex::new(None)),
        }
    }

    /// Check if the heartbeat task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the heartbeat gave up and terminated the instance.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Consecutive failed reports.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Validity granted by the last successful report.
    #[must_use]
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        *self.valid_until.lock()
    }

    /// Stop the heartbeat task.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn report(
    aggregate: &dyn ResourceAggregate,
    tokens: &dyn ServiceTokenProvider,
    config: &HeartbeatConfig,
) -> GatewayResult<DateTime<Utc>> {
    let token = tokens.service_token().await?;
    let command = Command::UpdateServiceMetadata {
        heartbeat: ServiceHeartbeat {
            service_id: config.service_id.clone(),
            time_to_live: config.time_to_live,
        },
    };
    let response = tokio::time::timeout(config.interval(), aggregate.submit(&token, command)).await??;
    let ttl = chrono::Duration::from_std(config.time_to_live).unwrap_or_else(|_| chrono::Duration::zero());
    Ok(response.valid_until.unwrap_or_else(|| Utc::now() + ttl))
}

/// Start the periodic service heartbeat.
///
/// Returns a handle to control the task and monitor its state.
pub fn start_service_heartbeat(
    aggregate: Arc<dyn ResourceAggregate>,
    tokens: Arc<dyn ServiceTokenProvider>,
    config: HeartbeatConfig,
    terminator: Arc<dyn Terminator>,
) -> HeartbeatHandle {
    let handle = HeartbeatHandle::new();
    handle.running.store(true, Ordering::SeqCst);
    let task = handle.clone();

    tokio::spawn(async move {
        let mut monitor = HeartbeatMonitor::new(config.max_failures);
        let mut interval_timer = tokio::time::interval(config.interval());

        while task.running.load(Ordering::SeqCst) {
            interval_timer.tick().await;

            if !task.running.load(Ordering::SeqCst) {
                break;
            }

            let (verdict, reason) = match report(aggregate.as_ref(), tokens.as_ref(), &config).await {
                Ok(valid_until) => {
                    let previous = monitor.valid_until();
                    let verdict = monitor.on_success(Utc::now(), valid_until);
                    task.failures.store(0, Ordering::SeqCst);
                    *task.valid_until.lock() = Some(valid_until);
                    debug!(service_id = %config.service_id, %valid_until, "heartbeat reported");
                    let reason = format!(
                        "service heartbeat validity lapsed at {}",
                        previous.map_or_else(String::new, |v| v.to_rfc3339())
                    );
                    (verdict, reason)
                }
                Err(e) => {
                    let verdict = monitor.on_failure(Utc::now());
                    task.failures.store(monitor.failures(), Ordering::SeqCst);
                    if verdict == Verdict::Continue {
                        warn!(service_id = %config.service_id, error = %e, "heartbeat failed");
                    }
                    (verdict, format!("service heartbeat failed: {e}"))
                }
            };
            if verdict == Verdict::Continue {
                continue;
            }
            error!(
                service_id = %config.service_id,
                failures = monitor.failures(),
                %reason,
                "service liveness lost, terminating"
            );
            task.running.store(false, Ordering::SeqCst);
            if !task.terminated.swap(true, Ordering::SeqCst) {
                terminator.terminate(&reason);
            }
            break;
        }
    });

    handle
}
