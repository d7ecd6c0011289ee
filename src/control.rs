//! Container lifecycle capability
//!
//! Idle watchers drive backends through [`ContainerControl`]. The Docker
//! engine client and the remote agent client both implement it; tests plug in
//! fakes.

use crate::agent::{AgentClient, AgentContainer};
use crate::docker::{DockerClient, DockerContainer, DEFAULT_DOCKER_HOST};
use crate::error::{CapabilityError, RouteError};
use crate::events::Event;
use crate::route::RouteConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Runtime state of a container as reported by its engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Paused,
    Stopped,
    Unknown,
}

impl ContainerStatus {
    /// Map an engine state string (`running`, `paused`, `exited`, ...)
    pub fn from_state(state: &str) -> Self {
        match state {
            "running" | "restarting" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "exited" | "dead" | "created" | "removing" | "stopped" => ContainerStatus::Stopped,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Lifecycle events and errors of one container, until the token is cancelled
pub type EventStreams = (
    mpsc::UnboundedReceiver<Event>,
    mpsc::UnboundedReceiver<CapabilityError>,
);

#[async_trait]
pub trait ContainerControl: Send + Sync {
    /// Container this handle controls
    fn container_id(&self) -> &str;

    async fn pause(&self) -> Result<(), CapabilityError>;
    async fn unpause(&self) -> Result<(), CapabilityError>;
    async fn start(&self) -> Result<(), CapabilityError>;

    /// Graceful stop: send `signal` (engine default when `None`) and wait up
    /// to `timeout` before the engine kills the container
    async fn stop(&self, signal: Option<&str>, timeout: Duration) -> Result<(), CapabilityError>;

    async fn kill(&self, signal: Option<&str>) -> Result<(), CapabilityError>;

    async fn status(&self) -> Result<ContainerStatus, CapabilityError>;

    /// Subscribe to this container's lifecycle events
    fn watch(&self, cancel: CancellationToken) -> EventStreams;

    /// Release any resources held by the handle
    async fn close(&self) {}
}

/// Builds the capability handle for a route that has an idle watcher
#[async_trait]
pub trait ControlResolver: Send + Sync {
    async fn resolve(&self, route: &RouteConfig) -> Result<Arc<dyn ContainerControl>, RouteError>;
}

/// Resolves routes to Docker engines or remote agents.
///
/// Engine clients are shared per host.
pub struct DefaultResolver {
    agents: HashMap<String, Arc<AgentClient>>,
    engines: DashMap<String, Arc<DockerClient>>,
}

impl DefaultResolver {
    pub fn new(agents: HashMap<String, Arc<AgentClient>>) -> Self {
        Self {
            agents,
            engines: DashMap::new(),
        }
    }

    fn engine(&self, host: &str) -> Result<Arc<DockerClient>, CapabilityError> {
        if let Some(client) = self.engines.get(host) {
            return Ok(Arc::clone(client.value()));
        }
        let client = Arc::new(DockerClient::connect(Some(host))?);
        Ok(Arc::clone(
            self.engines
                .entry(host.to_string())
                .or_insert(client)
                .value(),
        ))
    }
}

#[async_trait]
impl ControlResolver for DefaultResolver {
    async fn resolve(&self, route: &RouteConfig) -> Result<Arc<dyn ContainerControl>, RouteError> {
        let container = route
            .container
            .as_ref()
            .ok_or_else(|| RouteError::Invalid(format!("route {} has no container", route.alias)))?;

        if let Some(name) = &route.agent {
            let agent = self
                .agents
                .get(name)
                .ok_or_else(|| RouteError::UnknownAgent(name.clone()))?;
            return Ok(Arc::new(AgentContainer::new(Arc::clone(agent), container.id.clone())));
        }

        let host = container.docker_host.as_deref().unwrap_or(DEFAULT_DOCKER_HOST);
        let engine = self.engine(host)?;
        Ok(Arc::new(DockerContainer::new(engine, container.id.clone())))
    }
}
