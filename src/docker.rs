//! Docker engine client and the container capability built on it

use crate::control::{ContainerControl, ContainerStatus, EventStreams};
use crate::error::CapabilityError;
use crate::events::{Event, EventAction};
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, KillContainerOptions, ListContainersOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::{ContainerSummary, EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

const CLIENT_TIMEOUT_SECS: u64 = 120;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Connection to one Docker engine
pub struct DockerClient {
    client: Docker,
    host: String,
}

impl DockerClient {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform default socket
    pub fn connect(docker_host: Option<&str>) -> Result<Self, CapabilityError> {
        let host = docker_host
            .map(str::to_string)
            .or_else(|| std::env::var("DOCKER_HOST").ok());

        let (client, host) = match host {
            Some(host) => (Self::connect_to_host(&host)?, host),
            None => {
                let client = Docker::connect_with_socket_defaults().map_err(|e| {
                    CapabilityError::Docker(format!(
                        "Cannot connect to Docker daemon: {}. \
                         Set DOCKER_HOST or configure a docker host explicitly.",
                        e
                    ))
                })?;
                (client, DEFAULT_DOCKER_HOST.to_string())
            }
        };

        Ok(Self { client, host })
    }

    fn connect_to_host(host: &str) -> Result<Docker, CapabilityError> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION).map_err(|e| {
                CapabilityError::Docker(format!("Cannot connect to Unix socket '{}': {}", socket_path, e))
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| CapabilityError::Docker(format!("Cannot connect to TCP endpoint '{}': {}", host, e)))
        } else {
            Err(CapabilityError::Docker(format!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Verify the daemon answers
    pub async fn ping(&self) -> Result<(), CapabilityError> {
        self.client.ping().await.map_err(|e| {
            CapabilityError::Docker(format!(
                "Docker daemon at {} is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                self.host, e
            ))
        })?;
        Ok(())
    }

    /// All containers, running or not
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, CapabilityError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        self.client
            .list_containers(Some(options))
            .await
            .map_err(|e| CapabilityError::Docker(format!("Failed to list containers: {}", e)))
    }

    pub async fn container_status(&self, container_id: &str) -> Result<ContainerStatus, CapabilityError> {
        let info = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(container_id, "inspect", e))?;

        let Some(state) = info.state else {
            return Ok(ContainerStatus::Unknown);
        };
        Ok(if state.paused.unwrap_or(false) {
            ContainerStatus::Paused
        } else if state.running.unwrap_or(false) {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        })
    }

    /// Container lifecycle events, optionally for one container only
    pub fn events(&self, container_id: Option<&str>, cancel: CancellationToken) -> EventStreams {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        if let Some(id) = container_id {
            filters.insert("container".to_string(), vec![id.to_string()]);
        }
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let client = self.client.clone();
        let host = self.host.clone();
        tokio::spawn(async move {
            let mut stream = client.events(Some(options));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = stream.next() => match message {
                        Some(Ok(message)) => {
                            if let Some(event) = to_event(message) {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = err_tx.send(CapabilityError::Events(e.to_string()));
                        }
                        None => {
                            debug!(host, "Docker event stream ended");
                            break;
                        }
                    }
                }
            }
        });

        (event_rx, err_rx)
    }
}

fn map_error(container_id: &str, op: &str, e: bollard::errors::Error) -> CapabilityError {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
            CapabilityError::NotFound(container_id.to_string())
        }
        e => CapabilityError::Docker(format!("Failed to {} container {}: {}", op, container_id, e)),
    }
}

fn to_event(message: EventMessage) -> Option<Event> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let action = message.action?;
    let actor = message.actor.unwrap_or_default();
    let attributes = actor.attributes.unwrap_or_default();
    let name = attributes.get("name").cloned().unwrap_or_default();
    let id = actor.id.unwrap_or_default();

    let mut event = Event::docker(EventAction::from_docker(&action), name, id);
    event.attributes = attributes;
    Some(event)
}

/// A single container driven through the Docker API
pub struct DockerContainer {
    client: Arc<DockerClient>,
    id: String,
}

impl DockerContainer {
    pub fn new(client: Arc<DockerClient>, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }

    async fn wait_stopped(&self, timeout: Duration) -> Result<bool, CapabilityError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.client.container_status(&self.id).await? != ContainerStatus::Running {
                return Ok(true);
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        Ok(false)
    }
}

#[async_trait]
impl ContainerControl for DockerContainer {
    fn container_id(&self) -> &str {
        &self.id
    }

    async fn pause(&self) -> Result<(), CapabilityError> {
        match self.client.client.pause_container(&self.id).await {
            Ok(_) => {
                info!(container_id = %self.id, "Paused Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => {
                // Already paused or not running
                debug!(container_id = %self.id, "Container not pausable");
                Ok(())
            }
            Err(e) => Err(map_error(&self.id, "pause", e)),
        }
    }

    async fn unpause(&self) -> Result<(), CapabilityError> {
        match self.client.client.unpause_container(&self.id).await {
            Ok(_) => {
                info!(container_id = %self.id, "Unpaused Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => {
                debug!(container_id = %self.id, "Container was not paused");
                Ok(())
            }
            Err(e) => Err(map_error(&self.id, "unpause", e)),
        }
    }

    async fn start(&self) -> Result<(), CapabilityError> {
        match self
            .client
            .client
            .start_container(&self.id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container_id = %self.id, "Started Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container_id = %self.id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(map_error(&self.id, "start", e)),
        }
    }

    async fn stop(&self, signal: Option<&str>, timeout: Duration) -> Result<(), CapabilityError> {
        if let Some(signal) = signal {
            // Custom stop signal: deliver it, then give the process `timeout` to exit.
            self.kill(Some(signal)).await?;
            if self.wait_stopped(timeout).await? {
                info!(container_id = %self.id, signal, "Stopped Docker container");
                return Ok(());
            }
            return Err(CapabilityError::Timeout { op: "stop", timeout });
        }

        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.client.client.stop_container(&self.id, Some(options)).await {
            Ok(_) => {
                info!(container_id = %self.id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(container_id = %self.id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(map_error(&self.id, "stop", e)),
        }
    }

    async fn kill(&self, signal: Option<&str>) -> Result<(), CapabilityError> {
        let options = KillContainerOptions {
            signal: signal.unwrap_or("SIGKILL"),
        };
        match self.client.client.kill_container(&self.id, Some(options)).await {
            Ok(_) => {
                info!(container_id = %self.id, "Killed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => {
                // Container not running
                debug!(container_id = %self.id, "Container not running");
                Ok(())
            }
            Err(e) => Err(map_error(&self.id, "kill", e)),
        }
    }

    async fn status(&self) -> Result<ContainerStatus, CapabilityError> {
        self.client.container_status(&self.id).await
    }

    fn watch(&self, cancel: CancellationToken) -> EventStreams {
        self.client.events(Some(&self.id), cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EventActor;

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        let err = DockerClient::connect(Some("ftp://docker")).err().unwrap();
        assert!(err.to_string().contains("Invalid docker host format"));
    }

    #[test]
    fn test_event_message_conversion() {
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), "web".to_string());
        attributes.insert("proxy.aliases".to_string(), "web".to_string());

        let message = EventMessage {
            typ: Some(EventMessageTypeEnum::CONTAINER),
            action: Some("die".to_string()),
            actor: Some(EventActor {
                id: Some("abc123".to_string()),
                attributes: Some(attributes),
            }),
            ..Default::default()
        };

        let event = to_event(message).unwrap();
        assert_eq!(event.action, EventAction::Die);
        assert_eq!(event.actor_name, "web");
        assert_eq!(event.actor_id, "abc123");
        assert_eq!(event.attributes["proxy.aliases"], "web");
    }

    #[test]
    fn test_non_container_events_are_ignored() {
        let message = EventMessage {
            typ: Some(EventMessageTypeEnum::NETWORK),
            action: Some("connect".to_string()),
            ..Default::default()
        };
        assert!(to_event(message).is_none());
    }
}
