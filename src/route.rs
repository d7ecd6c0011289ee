//! Routes
//!
//! A route exposes one backend under a unique alias. HTTP routes are served
//! by the shared entrypoint; `tcp` and `udp` routes own a listener and run
//! their own accept loop. Every route lives on a `route.<alias>` task under
//! its provider and removes itself from the registry when that task finishes.

use crate::agent::AgentClient;
use crate::control::ControlResolver;
use crate::error::RouteError;
use crate::health::{HealthCheckConfig, HealthMonitor, HealthSnapshot, Monitor, Status};
use crate::idlewatcher::{IdleWatcher, IdleWatcherConfig};
use crate::probe;
use crate::registry::RouteRegistry;
use crate::stream::{new_stream, Stream};
use crate::task::{FinishReason, Task};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transport of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Tcp,
    Udp,
}

impl Scheme {
    /// Raw stream schemes own a listener
    pub fn is_stream(self) -> bool {
        matches!(self, Scheme::Tcp | Scheme::Udp)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Tcp => "tcp",
            Scheme::Udp => "udp",
        })
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "tcp" => Ok(Scheme::Tcp),
            "udp" => Ok(Scheme::Udp),
            other => Err(format!("unknown scheme {:?}", other)),
        }
    }
}

/// The container backing a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    /// Engine endpoint; the local default when unset
    #[serde(default)]
    pub docker_host: Option<String>,
    /// Container id or name
    pub id: String,
}

/// Definition of a route as loaded from a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Set by the provider from the map key or container labels
    #[serde(skip)]
    pub alias: String,
    #[serde(skip)]
    pub provider: String,

    #[serde(default)]
    pub scheme: Scheme,

    /// Backend host
    #[serde(default = "default_host")]
    pub host: String,

    /// Backend port
    #[serde(default)]
    pub port: u16,

    /// Local port of a stream route (0 picks an ephemeral port)
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// Known to the provider but never started
    #[serde(default)]
    pub exclude: bool,

    #[serde(default)]
    pub healthcheck: HealthCheckConfig,

    #[serde(default)]
    pub idle_watcher: Option<IdleWatcherConfig>,

    #[serde(default)]
    pub container: Option<ContainerRef>,

    /// Remote agent that reaches the backend
    #[serde(default)]
    pub agent: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl RouteConfig {
    pub fn http(alias: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            alias: alias.into(),
            provider: String::new(),
            scheme: Scheme::Http,
            host: host.into(),
            port,
            listen_port: None,
            exclude: false,
            healthcheck: HealthCheckConfig::default(),
            idle_watcher: None,
            container: None,
            agent: None,
        }
    }

    pub fn stream(
        alias: impl Into<String>,
        scheme: Scheme,
        listen_port: u16,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            scheme,
            listen_port: Some(listen_port),
            ..Self::http(alias, host, port)
        }
    }

    /// `host:port` of the backend
    pub fn target(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.alias.is_empty() {
            return Err("alias must not be empty".to_string());
        }
        if !self
            .alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(format!(
                "alias {:?} may only contain letters, digits, '-', '_' and '.'",
                self.alias
            ));
        }
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port is required".to_string());
        }
        match (self.scheme.is_stream(), self.listen_port) {
            (true, None) => return Err(format!("{} route needs a listen_port", self.scheme)),
            (false, Some(_)) => return Err("listen_port is only valid for tcp and udp routes".to_string()),
            _ => {}
        }
        if let Some(path) = &self.healthcheck.path {
            if !path.starts_with('/') {
                return Err(format!("healthcheck path {:?} must start with '/'", path));
            }
        }
        if let Some(idle) = &self.idle_watcher {
            idle.validate()?;
            if self.container.is_none() {
                return Err("idle_watcher requires a container".to_string());
            }
        }
        Ok(())
    }
}

/// Shared collaborators every route needs to start
#[derive(Clone)]
pub struct RouteContext {
    pub registry: Arc<RouteRegistry>,
    pub resolver: Arc<dyn ControlResolver>,
    pub agents: Arc<HashMap<String, Arc<AgentClient>>>,
    /// Address stream listeners bind to
    pub listen_host: IpAddr,
}

impl RouteContext {
    pub fn new(registry: Arc<RouteRegistry>, resolver: Arc<dyn ControlResolver>) -> Self {
        Self {
            registry,
            resolver,
            agents: Arc::new(HashMap::new()),
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn with_agents(mut self, agents: HashMap<String, Arc<AgentClient>>) -> Self {
        self.agents = Arc::new(agents);
        self
    }

    pub fn with_listen_host(mut self, host: IpAddr) -> Self {
        self.listen_host = host;
        self
    }
}

/// A live route
pub struct Route {
    config: RouteConfig,
    task: OnceLock<Task>,
    health: RwLock<Option<Arc<dyn HealthMonitor>>>,
    idle_watcher: OnceLock<Arc<IdleWatcher>>,
    stream: OnceLock<Arc<dyn Stream>>,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Route {
    pub fn new(config: RouteConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            task: OnceLock::new(),
            health: RwLock::new(None),
            idle_watcher: OnceLock::new(),
            stream: OnceLock::new(),
            accept_loop: Mutex::new(None),
        })
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    pub fn scheme(&self) -> Scheme {
        self.config.scheme
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.get()
    }

    pub fn health_monitor(&self) -> Option<Arc<dyn HealthMonitor>> {
        self.health.read().clone()
    }

    pub fn idle_watcher(&self) -> Option<&Arc<IdleWatcher>> {
        self.idle_watcher.get()
    }

    /// Bound address of a stream route once it is listening
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.stream.get().and_then(|s| s.local_addr())
    }

    /// True once the route's task has finished
    pub fn is_finished(&self) -> bool {
        self.task.get().map(Task::is_finished).unwrap_or(false)
    }

    /// Reserve the alias and bring the route up under `parent`.
    ///
    /// The route's task is bound to the parent's finish, so a provider drains
    /// its event queue before any of its routes go down. On error the route
    /// has already been torn down and deregistered.
    pub async fn start(self: &Arc<Self>, parent: &Task, ctx: &RouteContext) -> Result<(), RouteError> {
        if let Err(existing) = ctx.registry.register(Arc::clone(self)) {
            return Err(RouteError::AliasCollision {
                alias: self.config.alias.clone(),
                existing: existing.provider().to_string(),
                incoming: self.config.provider.clone(),
            });
        }

        let task = parent.subtask(format!("route.{}", self.config.alias), false);
        if self.task.set(task.clone()).is_err() {
            ctx.registry.deregister(self);
            return Err(RouteError::Invalid(format!(
                "route {} started twice",
                self.config.alias
            )));
        }

        let this = Arc::clone(self);
        let registry = Arc::clone(&ctx.registry);
        task.on_finished("deregister", move || {
            if let Some(stream) = this.stream.get() {
                stream.close();
            }
            registry.deregister(&this);
            debug!(alias = %this.config.alias, "Route deregistered");
        });

        if task.is_cancelled() {
            task.wait_finished().await;
            return Err(RouteError::Cancelled);
        }

        if let Err(e) = self.setup(&task, ctx).await {
            error!(alias = %self.config.alias, provider = %self.config.provider, error = %e, "Failed to start route");
            task.finish(FinishReason::error(&e)).await;
            return Err(e);
        }

        info!(
            alias = %self.config.alias,
            provider = %self.config.provider,
            scheme = %self.config.scheme,
            target = %self.config.target(),
            listen = ?self.listen_addr(),
            "Route started"
        );
        Ok(())
    }

    async fn setup(self: &Arc<Self>, task: &Task, ctx: &RouteContext) -> Result<(), RouteError> {
        let checker = probe::new_checker(&self.config, &ctx.agents)?;

        if let Some(idle) = &self.config.idle_watcher {
            let control = ctx.resolver.resolve(&self.config).await?;
            let watcher = IdleWatcher::new(
                self.config.alias.clone(),
                idle.clone(),
                control,
                Arc::clone(&checker),
            );
            let _ = self.idle_watcher.set(watcher);
        }

        if self.config.scheme.is_stream() {
            let listen = SocketAddr::new(ctx.listen_host, self.config.listen_port.unwrap_or(0));
            let mut stream = new_stream(self.config.scheme, listen, self.config.target())
                .ok_or_else(|| RouteError::Invalid(format!("{} is not a stream scheme", self.config.scheme)))?;
            if let Some(watcher) = self.idle_watcher.get() {
                stream = watcher.wrap_stream(stream);
            }
            stream.setup().await?;
            let _ = self.stream.set(stream);
        }

        let monitor: Option<Arc<dyn HealthMonitor>> = match self.idle_watcher.get() {
            Some(watcher) => Some(Arc::clone(watcher) as Arc<dyn HealthMonitor>),
            None if self.config.healthcheck.disable => None,
            None => Some(Arc::new(Monitor::new(self.config.alias.clone(), checker))),
        };
        if let Some(monitor) = monitor {
            Arc::clone(&monitor).start(task);
            *self.health.write() = Some(monitor);
        }

        if let Some(stream) = self.stream.get() {
            self.spawn_accept_loop(task, Arc::clone(stream));
        }
        Ok(())
    }

    fn spawn_accept_loop(&self, task: &Task, stream: Arc<dyn Stream>) {
        let token = task.token();
        let route_task = task.clone();
        let alias = self.config.alias.clone();

        let handle = task.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = stream.accept() => accepted,
                };
                match accepted {
                    Ok(conn) => {
                        let stream = Arc::clone(&stream);
                        let cancel = token.child_token();
                        tokio::spawn(async move { stream.handle(conn, cancel).await });
                    }
                    Err(_) if token.is_cancelled() => break,
                    Err(e) => {
                        error!(alias = %alias, error = %e, "Accept failed, stopping route");
                        route_task
                            .finish(FinishReason::error(RouteError::Accept(e)))
                            .await;
                        break;
                    }
                }
            }
            debug!(alias = %alias, "Accept loop stopped");
        });
        *self.accept_loop.lock() = Some(handle);
    }

    /// Finish the route and wait until its listener is released
    pub async fn stop(&self, reason: FinishReason) {
        if let Some(task) = self.task.get() {
            task.finish(reason).await;
        }
        let handle = self.accept_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(alias = %self.config.alias, error = %e, "Accept loop did not exit cleanly");
            }
        }
    }

    pub fn snapshot(&self) -> RouteSnapshot {
        let health = match self.health_monitor() {
            Some(monitor) => monitor.snapshot(),
            None => HealthSnapshot {
                status: Status::Unknown,
                uptime_secs: 0.0,
                latency_ms: 0.0,
                detail: String::new(),
                last_check: None,
            },
        };
        RouteSnapshot {
            alias: self.config.alias.clone(),
            provider: self.config.provider.clone(),
            scheme: self.config.scheme,
            target: self.config.target(),
            listen: self.listen_addr().map(|a| a.to_string()),
            health,
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("alias", &self.config.alias)
            .field("provider", &self.config.provider)
            .field("scheme", &self.config.scheme)
            .field("target", &self.config.target())
            .finish()
    }
}

/// Admin view of a route
#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    pub alias: String,
    pub provider: String,
    pub scheme: Scheme,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(flatten)]
    pub health: HealthSnapshot,
}
