//! Idle watcher
//!
//! Naps a route's backend after a period without traffic and wakes it again
//! on the next request or connection. Callers that arrive while the backend
//! is napping are held until it is ready; however many of them there are,
//! exactly one wake sequence runs and they all share its outcome.
//!
//! Every capability call (pause, start, stop, ...) goes through a single
//! async mutex, so a nap can never interleave with a wake.

use crate::control::{ContainerControl, ContainerStatus};
use crate::error::{CapabilityError, WakeError};
use crate::events::Event;
use crate::health::{HealthChecker, HealthInfo, HealthMonitor, HealthSnapshot, Status};
use crate::stream::{Stream, StreamConn};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Readiness poll period while a wake is in progress
const WAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extra time granted to the engine on top of `stop_timeout`
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How an idle backend is put to sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMethod {
    #[default]
    Pause,
    Stop,
    Kill,
}

impl FromStr for StopMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(StopMethod::Pause),
            "stop" => Ok(StopMethod::Stop),
            "kill" => Ok(StopMethod::Kill),
            other => Err(format!("unknown stop method {:?}", other)),
        }
    }
}

impl fmt::Display for StopMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopMethod::Pause => "pause",
            StopMethod::Stop => "stop",
            StopMethod::Kill => "kill",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleWatcherConfig {
    #[serde(with = "crate::config::duration")]
    pub idle_timeout: Duration,

    #[serde(default, with = "crate::config::duration::option")]
    pub wake_timeout: Option<Duration>,

    #[serde(default)]
    pub stop_method: StopMethod,

    /// Signal for `stop`/`kill`, engine default when unset
    #[serde(default)]
    pub stop_signal: Option<String>,

    #[serde(default, with = "crate::config::duration::option")]
    pub stop_timeout: Option<Duration>,

    /// When set, only requests to this path may wake a napping backend
    #[serde(default)]
    pub start_endpoint: Option<String>,
}

impl IdleWatcherConfig {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            wake_timeout: None,
            stop_method: StopMethod::default(),
            stop_signal: None,
            stop_timeout: None,
            start_endpoint: None,
        }
    }

    pub fn wake_timeout(&self) -> Duration {
        self.wake_timeout.unwrap_or(DEFAULT_WAKE_TIMEOUT)
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.wake_timeout == Some(Duration::ZERO) {
            return Err("wake_timeout must be greater than 0".to_string());
        }
        if let Some(ep) = &self.start_endpoint {
            if !ep.starts_with('/') {
                return Err(format!("start_endpoint {:?} must start with '/'", ep));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct WatcherState {
    ready: bool,
    status: ContainerStatus,
    err: Option<String>,
    ready_since: Option<Instant>,
    latency: Duration,
}

type WakeFuture = Shared<BoxFuture<'static, Result<(), WakeError>>>;

pub struct IdleWatcher {
    name: String,
    config: IdleWatcherConfig,
    control: Arc<dyn ContainerControl>,
    checker: Arc<dyn HealthChecker>,
    state: RwLock<WatcherState>,
    last_reset: Mutex<(Instant, DateTime<Utc>)>,
    active: AtomicUsize,
    became_ready: Notify,
    ops: tokio::sync::Mutex<()>,
    wake_in_flight: Mutex<Option<WakeFuture>>,
    task: OnceLock<Task>,
}

impl IdleWatcher {
    pub fn new(
        name: impl Into<String>,
        config: IdleWatcherConfig,
        control: Arc<dyn ContainerControl>,
        checker: Arc<dyn HealthChecker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            control,
            checker,
            state: RwLock::new(WatcherState {
                ready: false,
                status: ContainerStatus::Unknown,
                err: None,
                ready_since: None,
                latency: Duration::ZERO,
            }),
            last_reset: Mutex::new((Instant::now(), Utc::now())),
            active: AtomicUsize::new(0),
            became_ready: Notify::new(),
            ops: tokio::sync::Mutex::new(()),
            wake_in_flight: Mutex::new(None),
            task: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &IdleWatcherConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        state.ready && state.status == ContainerStatus::Running
    }

    pub fn container_status(&self) -> ContainerStatus {
        self.state.read().status
    }

    /// Whether a request to `path` may wake the backend
    pub fn may_wake(&self, path: &str) -> bool {
        if self.is_ready() {
            return true;
        }
        match &self.config.start_endpoint {
            Some(endpoint) => path == endpoint,
            None => true,
        }
    }

    /// Record traffic
    pub fn reset_idle_timer(&self) {
        *self.last_reset.lock() = (Instant::now(), Utc::now());
    }

    /// Track one in-flight request or connection until the guard drops.
    ///
    /// The backend is never napped while a guard is alive.
    pub fn activity(self: &Arc<Self>) -> ActivityGuard {
        {
            // Counted under the state lock, which a nap holds while it decides.
            let _state = self.state.read();
            self.active.fetch_add(1, Ordering::SeqCst);
        }
        self.reset_idle_timer();
        ActivityGuard {
            watcher: Arc::clone(self),
        }
    }

    /// Wrap a stream transport so every connection wakes the backend first
    pub fn wrap_stream(self: &Arc<Self>, inner: Arc<dyn Stream>) -> Arc<dyn Stream> {
        Arc::new(IdleStream {
            watcher: Arc::clone(self),
            inner,
        })
    }

    fn token(&self) -> CancellationToken {
        self.task
            .get()
            .map(Task::token)
            .unwrap_or_default()
    }

    fn set_error(&self, err: impl fmt::Display) {
        let mut state = self.state.write();
        state.err = Some(err.to_string());
        state.ready = false;
        state.ready_since = None;
    }

    fn set_napping(&self, status: ContainerStatus) {
        let mut state = self.state.write();
        state.status = status;
        state.ready = false;
        state.ready_since = None;
    }

    fn mark_ready(&self, latency: Duration) {
        {
            let mut state = self.state.write();
            state.status = ContainerStatus::Running;
            state.ready = true;
            state.err = None;
            state.latency = latency;
            state.ready_since.get_or_insert_with(Instant::now);
        }
        self.reset_idle_timer();
        self.became_ready.notify_one();
    }

    /// Bring the backend up and wait until it serves.
    ///
    /// Concurrent callers join the wake already in flight.
    pub async fn wake(self: &Arc<Self>) -> Result<(), WakeError> {
        if self.is_ready() {
            return Ok(());
        }

        let wake = {
            let mut slot = self.wake_in_flight.lock();
            match slot.as_ref() {
                Some(wake) => wake.clone(),
                None => {
                    let this = Arc::clone(self);
                    // Spawned so a caller giving up never aborts the wake for the others.
                    let handle = tokio::spawn(async move { this.run_wake().await });
                    let wake = async move { handle.await.unwrap_or(Err(WakeError::Cancelled)) }
                        .boxed()
                        .shared();
                    *slot = Some(wake.clone());
                    wake
                }
            }
        };

        wake.await
    }

    async fn run_wake(self: Arc<Self>) -> Result<(), WakeError> {
        let timeout = self.config.wake_timeout();
        let token = self.token();

        info!(route = %self.name, "Waking backend");
        let started = Instant::now();

        let result = tokio::select! {
            _ = token.cancelled() => Err(WakeError::Cancelled),
            r = tokio::time::timeout(timeout, self.wake_sequence()) => match r {
                Ok(r) => r,
                Err(_) => Err(WakeError::Timeout(timeout)),
            },
        };

        match &result {
            Ok(()) => info!(
                route = %self.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Backend is ready"
            ),
            Err(WakeError::Cancelled) => debug!(route = %self.name, "Wake cancelled"),
            Err(e) => {
                warn!(route = %self.name, error = %e, "Failed to wake backend");
                self.set_error(e);
            }
        }

        *self.wake_in_flight.lock() = None;
        result
    }

    async fn wake_sequence(&self) -> Result<(), WakeError> {
        {
            let _ops = self.ops.lock().await;
            let status = self.control.status().await?;
            {
                let mut state = self.state.write();
                state.status = ContainerStatus::Running;
                state.ready = false;
                state.err = None;
            }
            match status {
                ContainerStatus::Paused => {
                    debug!(route = %self.name, "Unpausing container");
                    self.control.unpause().await?;
                }
                ContainerStatus::Stopped | ContainerStatus::Unknown => {
                    debug!(route = %self.name, status = %status, "Starting container");
                    self.control.start().await?;
                }
                ContainerStatus::Running => {}
            }
        }

        let probe_timeout = self.checker.config().timeout();
        loop {
            if self.control.status().await? == ContainerStatus::Running {
                match tokio::time::timeout(probe_timeout, self.checker.check_health()).await {
                    Ok(Ok(result)) if result.healthy => {
                        self.mark_ready(result.latency);
                        return Ok(());
                    }
                    Ok(Ok(result)) => {
                        debug!(route = %self.name, detail = %result.detail, "Backend not ready yet")
                    }
                    Ok(Err(e)) => debug!(route = %self.name, error = %e, "Backend not ready yet"),
                    Err(_) => debug!(route = %self.name, "Readiness probe timed out"),
                }
            }
            tokio::time::sleep(WAKE_POLL_INTERVAL).await;
        }
    }

    /// Put the backend to sleep per the configured stop method.
    ///
    /// The watcher leaves the ready state before the capability is called, so
    /// traffic arriving mid-nap goes through a wake, which queues behind this
    /// nap on the ops lock.
    async fn nap(&self) {
        let _ops = self.ops.lock().await;
        let napped_status = match self.config.stop_method {
            StopMethod::Pause => ContainerStatus::Paused,
            StopMethod::Stop | StopMethod::Kill => ContainerStatus::Stopped,
        };
        {
            let mut state = self.state.write();
            let ready = state.ready && state.status == ContainerStatus::Running;
            if !ready || self.active.load(Ordering::SeqCst) > 0 {
                return;
            }
            state.ready = false;
            state.ready_since = None;
            state.status = napped_status;
        }

        info!(
            route = %self.name,
            method = %self.config.stop_method,
            idle_timeout = ?self.config.idle_timeout,
            "Idle timeout reached, napping backend"
        );

        let signal = self.config.stop_signal.as_deref();
        let result = match self.config.stop_method {
            StopMethod::Pause => self.control.pause().await,
            StopMethod::Stop => self.stop_or_kill(signal).await,
            StopMethod::Kill => self.control.kill(signal).await,
        };

        if let Err(e) = result {
            error!(route = %self.name, error = %e, "Failed to nap backend");
            self.set_error(e);
        }
    }

    async fn stop_or_kill(&self, signal: Option<&str>) -> Result<(), CapabilityError> {
        let stop_timeout = self.config.stop_timeout();
        match tokio::time::timeout(stop_timeout + STOP_GRACE, self.control.stop(signal, stop_timeout)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => warn!(route = %self.name, error = %e, "Stop failed, killing container"),
            Err(_) => warn!(route = %self.name, timeout = ?stop_timeout, "Stop timed out, killing container"),
        }
        self.control.kill(None).await
    }

    async fn idle_loop(self: Arc<Self>, token: CancellationToken) {
        let idle_timeout = self.config.idle_timeout;
        loop {
            let deadline = self.last_reset.lock().0 + idle_timeout;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.became_ready.notified() => continue,
                _ = tokio::time::sleep_until(deadline.into()) => {}
            }

            if !self.is_ready() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = self.became_ready.notified() => continue,
                }
            }

            let idle_for = self.last_reset.lock().0.elapsed();
            if idle_for < idle_timeout {
                continue;
            }
            if self.active.load(Ordering::SeqCst) > 0 {
                self.reset_idle_timer();
                continue;
            }
            self.nap().await;
        }
    }

    async fn event_loop(self: Arc<Self>, token: CancellationToken) {
        let (mut events, mut errors) = self.control.watch(token.child_token());
        let mut errors_open = true;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_container_event(&event),
                    None => {
                        debug!(route = %self.name, "Container event stream closed");
                        token.cancelled().await;
                        break;
                    }
                },
                err = errors.recv(), if errors_open => match err {
                    Some(e) => warn!(route = %self.name, error = %e, "Container event stream error"),
                    None => errors_open = false,
                },
            }
        }
        self.control.close().await;
    }

    fn on_container_event(&self, event: &Event) {
        let action = event.action;
        if action.is_container_down() {
            let status = if action == crate::events::EventAction::Pause {
                ContainerStatus::Paused
            } else {
                ContainerStatus::Stopped
            };
            if self.container_status() != status {
                info!(route = %self.name, action = %action, "Container went down");
            }
            self.set_napping(status);
        } else if action.is_container_up() {
            let mut state = self.state.write();
            // Our own wake already confirmed readiness.
            if state.ready {
                return;
            }
            info!(route = %self.name, action = %action, "Container started externally");
            state.status = ContainerStatus::Running;
            state.err = None;
        }
    }

    /// Learn the container's state at startup; a running, healthy backend
    /// starts its idle countdown immediately.
    async fn initial_probe(&self) {
        let status = match self.control.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(route = %self.name, error = %e, "Failed to inspect container");
                self.set_error(e);
                return;
            }
        };
        self.state.write().status = status;

        if status == ContainerStatus::Running {
            let timeout = self.checker.config().timeout();
            if let Ok(Ok(result)) = tokio::time::timeout(timeout, self.checker.check_health()).await {
                if result.healthy {
                    self.mark_ready(result.latency);
                }
            }
        }
        debug!(route = %self.name, status = %status, ready = self.is_ready(), "Idle watcher attached");
    }

    pub fn snapshot_debug(&self) -> IdleWatcherSnapshot {
        let state = self.state.read();
        let (_, last_reset) = *self.last_reset.lock();
        let ready = state.ready && state.status == ContainerStatus::Running;
        let expires = if ready {
            chrono::Duration::from_std(self.config.idle_timeout)
                .ok()
                .map(|d| last_reset + d)
        } else {
            None
        };
        IdleWatcherSnapshot {
            name: self.name.clone(),
            status: status_of(&state),
            container_status: state.status,
            ready,
            error: state.err.clone(),
            expires,
            last_reset,
            active: self.active.load(Ordering::SeqCst),
            config: self.config.clone(),
        }
    }
}

fn status_of(state: &WatcherState) -> Status {
    if state.err.is_some() {
        return Status::Error;
    }
    match state.status {
        ContainerStatus::Paused | ContainerStatus::Stopped => Status::Napping,
        ContainerStatus::Running if state.ready => Status::Healthy,
        ContainerStatus::Running => Status::Starting,
        ContainerStatus::Unknown => Status::Unknown,
    }
}

/// Debug view of an idle watcher
#[derive(Debug, Clone, Serialize)]
pub struct IdleWatcherSnapshot {
    pub name: String,
    pub status: Status,
    pub container_status: ContainerStatus,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub last_reset: DateTime<Utc>,
    pub active: usize,
    pub config: IdleWatcherConfig,
}

impl HealthInfo for IdleWatcher {
    fn status(&self) -> Status {
        status_of(&self.state.read())
    }

    fn uptime(&self) -> Duration {
        self.state
            .read()
            .ready_since
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn latency(&self) -> Duration {
        self.state.read().latency
    }

    fn detail(&self) -> String {
        self.state.read().err.clone().unwrap_or_default()
    }
}

impl HealthMonitor for IdleWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(self: Arc<Self>, parent: &Task) {
        let task = parent.subtask("idlewatcher", true);
        if self.task.set(task.clone()).is_err() {
            warn!(route = %self.name, "Idle watcher already started");
            return;
        }
        let token = task.token();

        let this = Arc::clone(&self);
        let events_token = token.clone();
        task.spawn(async move { this.event_loop(events_token).await });

        task.spawn(async move {
            self.initial_probe().await;
            self.idle_loop(token).await;
        });
    }

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status(),
            uptime_secs: self.uptime().as_secs_f64(),
            latency_ms: self.latency().as_secs_f64() * 1000.0,
            detail: self.detail(),
            last_check: Some(self.last_reset.lock().1),
        }
    }
}

/// Marks one request or connection in flight
pub struct ActivityGuard {
    watcher: Arc<IdleWatcher>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.watcher.active.fetch_sub(1, Ordering::SeqCst);
        self.watcher.reset_idle_timer();
    }
}

struct IdleStream {
    watcher: Arc<IdleWatcher>,
    inner: Arc<dyn Stream>,
}

#[async_trait]
impl Stream for IdleStream {
    async fn setup(&self) -> Result<(), crate::error::RouteError> {
        self.inner.setup().await
    }

    async fn accept(&self) -> io::Result<StreamConn> {
        self.inner.accept().await
    }

    async fn handle(&self, conn: StreamConn, cancel: CancellationToken) {
        let _activity = self.watcher.activity();
        if let Err(e) = self.watcher.wake().await {
            warn!(route = %self.watcher.name, peer = %conn.peer(), error = %e, "Dropping connection, backend not ready");
            return;
        }
        self.inner.handle(conn, cancel).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) {
        self.inner.close()
    }
}
