//! Health monitoring
//!
//! A [`Monitor`] polls a [`HealthChecker`] on an interval and keeps the
//! route's current [`Status`], latency, uptime and failure detail. Idle
//! watchers implement the same [`HealthMonitor`] contract so the registry can
//! report on every route the same way.

use crate::error::HealthError;
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status of a route.
///
/// Values are bit flags so status classes can be tested with a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Status {
    #[default]
    Unknown = 0,
    Healthy = 1,
    Napping = 2,
    Starting = 4,
    Unhealthy = 8,
    Error = 16,
}

const GOOD_MASK: u8 = Status::Healthy as u8 | Status::Napping as u8 | Status::Starting as u8;
const IDLING_MASK: u8 = Status::Napping as u8 | Status::Starting as u8;

impl Status {
    /// Healthy, or idle on purpose
    pub fn good(self) -> bool {
        self as u8 & GOOD_MASK != 0
    }

    /// Anything not good, including a status nobody has checked yet
    pub fn bad(self) -> bool {
        !self.good()
    }

    /// Napping or waking up
    pub fn idling(self) -> bool {
        self as u8 & IDLING_MASK != 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Healthy => "healthy",
            Status::Napping => "napping",
            Status::Starting => "starting",
            Status::Unhealthy => "unhealthy",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single probe.
///
/// `latency` travels as integer nanoseconds on the wire so agent responses
/// decode directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(default, with = "latency_nanos")]
    pub latency: Duration,
}

impl HealthCheckResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            detail: String::new(),
            latency,
        }
    }

    pub fn unhealthy(detail: impl Into<String>, latency: Duration) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
            latency,
        }
    }
}

mod latency_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

/// Per-route health check settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub disable: bool,
    pub path: Option<String>,
    pub use_get: bool,
    #[serde(with = "crate::config::duration::option")]
    pub interval: Option<Duration>,
    #[serde(with = "crate::config::duration::option")]
    pub timeout: Option<Duration>,
}

impl HealthCheckConfig {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("/")
    }

    pub fn interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Something that can probe a backend once
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check_health(&self) -> Result<HealthCheckResult, HealthError>;

    /// Human-readable probe target, e.g. `http://127.0.0.1:3000/health`
    fn target(&self) -> String;

    fn config(&self) -> &HealthCheckConfig;
}

/// Read side of a route's health
pub trait HealthInfo: Send + Sync {
    fn status(&self) -> Status;
    fn uptime(&self) -> Duration;
    fn latency(&self) -> Duration;
    fn detail(&self) -> String;
}

/// A running health source attached to a route
pub trait HealthMonitor: HealthInfo {
    fn name(&self) -> &str;

    /// Start monitoring on a subtask of `parent`
    fn start(self: Arc<Self>, parent: &Task);

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status(),
            uptime_secs: self.uptime().as_secs_f64(),
            latency_ms: self.latency().as_secs_f64() * 1000.0,
            detail: self.detail(),
            last_check: None,
        }
    }
}

/// Point-in-time view of a route's health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: Status,
    pub uptime_secs: f64,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MonitorState {
    status: Status,
    detail: String,
    latency: Duration,
    uptime: Duration,
    healthy_since: Option<Instant>,
    last_check: Option<DateTime<Utc>>,
}

impl MonitorState {
    fn uptime(&self) -> Duration {
        self.uptime + self.healthy_since.map(|t| t.elapsed()).unwrap_or_default()
    }
}

/// Polling health monitor
pub struct Monitor {
    name: String,
    checker: Arc<dyn HealthChecker>,
    state: RwLock<MonitorState>,
}

impl Monitor {
    pub fn new(name: impl Into<String>, checker: Arc<dyn HealthChecker>) -> Self {
        Self {
            name: name.into(),
            checker,
            state: RwLock::new(MonitorState::default()),
        }
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_check
    }

    /// Run one bounded check and record its outcome
    async fn check_once(&self) {
        let timeout = self.checker.config().timeout();
        let result = match tokio::time::timeout(timeout, self.checker.check_health()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => HealthCheckResult::unhealthy(e.to_string(), Duration::ZERO),
            Err(_) => HealthCheckResult::unhealthy(
                format!("health check timed out after {:?}", timeout),
                timeout,
            ),
        };
        self.record(result);
    }

    fn record(&self, result: HealthCheckResult) {
        let mut state = self.state.write();
        let previous = state.status;
        state.latency = result.latency;
        state.last_check = Some(Utc::now());

        if result.healthy {
            state.status = Status::Healthy;
            state.detail.clear();
            if state.healthy_since.is_none() {
                state.healthy_since = Some(Instant::now());
            }
        } else {
            state.status = Status::Unhealthy;
            state.detail = result.detail;
            if let Some(since) = state.healthy_since.take() {
                state.uptime += since.elapsed();
            }
        }

        if previous != state.status {
            match state.status {
                Status::Healthy => info!(route = %self.name, "Route is healthy"),
                _ => warn!(
                    route = %self.name,
                    target = %self.checker.target(),
                    detail = %state.detail,
                    "Route is unhealthy"
                ),
            }
        }
    }
}

impl HealthInfo for Monitor {
    fn status(&self) -> Status {
        self.state.read().status
    }

    fn uptime(&self) -> Duration {
        self.state.read().uptime()
    }

    fn latency(&self) -> Duration {
        self.state.read().latency
    }

    fn detail(&self) -> String {
        self.state.read().detail.clone()
    }
}

impl HealthMonitor for Monitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(self: Arc<Self>, parent: &Task) {
        let task = parent.subtask("health_monitor", true);
        let token = task.token();
        let interval = self.checker.config().interval();

        debug!(
            route = %self.name,
            target = %self.checker.target(),
            interval = ?interval,
            "Health monitor started"
        );

        task.spawn(async move {
            loop {
                // A check interrupted by cancellation is dropped unrecorded.
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.check_once() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(route = %self.name, "Health monitor stopped");
        });
    }

    fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.read();
        HealthSnapshot {
            status: state.status,
            uptime_secs: state.uptime().as_secs_f64(),
            latency_ms: state.latency.as_secs_f64() * 1000.0,
            detail: state.detail.clone(),
            last_check: state.last_check,
        }
    }
}
